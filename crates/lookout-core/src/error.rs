use thiserror::Error;

use crate::predicate::FilterError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),

    #[error("type registry misconfigured: {0}")]
    Registry(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

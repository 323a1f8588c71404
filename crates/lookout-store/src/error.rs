use thiserror::Error;

use lookout_core::{CoreError, FilterError, RecordType};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),

    #[error("record type {0} has no index table")]
    Unindexed(RecordType),

    #[error("create requires an unassigned id")]
    IdAlreadyAssigned,

    #[error("update requires a persisted id")]
    MissingId,

    /// A single-id write touched an unexpected number of rows, or the
    /// payload/index pair went out of sync. Never swallowed.
    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

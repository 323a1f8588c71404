use thiserror::Error;

use lookout_core::TaskStatus;
use lookout_store::StoreError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A locked lease candidate could not be transitioned. The row lock
    /// should make this impossible; seeing it means the locking/ordering
    /// guarantee was violated.
    #[error("lease consistency violation: {0}")]
    LostLease(String),

    #[error("invalid task transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("status {0} is not terminal")]
    NotTerminal(TaskStatus),

    #[error("task execution failed: {0}")]
    Execution(String),
}

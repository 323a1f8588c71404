pub mod db;
pub mod engine;
pub mod error;
pub mod sql;

pub use db::init_pg_pool;
pub use engine::{BatchOutcome, RecordStore, MAX_BATCH_SIZE};
pub use error::StoreError;

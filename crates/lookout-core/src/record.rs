//! The generic record model persisted by the store.
//!
//! Every business object is a [`Record`]: a serde-serializable struct with
//! embedded [`RecordMeta`] (id, version, timestamps) and a statically declared
//! projection of fields onto its index-table columns. The projection replaces
//! the reflection the store would otherwise need; it is checked against the
//! type registry at startup.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::predicate::Value;

// ── Record types ────────────────────────────────────────────────────

/// Logical type of a persisted record. Each variant maps to a stable type
/// tag stored in the payload table and, for indexed types, an index table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Alert,
    Job,
    Task,
    Event,
}

impl RecordType {
    pub const ALL: [RecordType; 4] = [
        RecordType::Alert,
        RecordType::Job,
        RecordType::Task,
        RecordType::Event,
    ];
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::Alert => write!(f, "Alert"),
            RecordType::Job => write!(f, "Job"),
            RecordType::Task => write!(f, "Task"),
            RecordType::Event => write!(f, "Event"),
        }
    }
}

// ── Record metadata ─────────────────────────────────────────────────

/// Store-managed identity and versioning fields, embedded in every record.
///
/// `id` is assigned on first persist and stable thereafter; `version` is
/// bumped by the store on every successful update. The payload JSON carries
/// a copy of these fields, but the payload-table columns are authoritative:
/// reads overwrite the deserialized meta from the columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub update_time: Option<DateTime<Utc>>,
}

// ── Record trait ────────────────────────────────────────────────────

/// A typed business object the persistence engine can store.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {
    fn record_type() -> RecordType;

    fn meta(&self) -> &RecordMeta;

    fn meta_mut(&mut self) -> &mut RecordMeta;

    /// Denormalized `(column, value)` pairs for this type's index table, in
    /// the order the registry schema declares them. `None` values become SQL
    /// NULLs. Unindexed types return the default empty projection.
    fn index_values(&self) -> Vec<(&'static str, Option<Value>)> {
        Vec::new()
    }

    fn id(&self) -> Option<i64> {
        self.meta().id
    }
}

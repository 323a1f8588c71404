//! Static type registry: record type ↔ type tag ↔ index schema.
//!
//! The registry is the one place that knows which index table (if any) backs
//! each record type and which stable tag identifies it inside the payload
//! table. It is built once at process start with [`TypeRegistry::standard`],
//! verified for internal consistency, and passed by reference to the store
//! and queue — there is no global mutable state.

use std::collections::HashSet;

use crate::error::CoreError;
use crate::record::RecordType;

/// Name of the shared payload table.
pub const PAYLOAD_TABLE: &str = "record_payload";

/// Columns a guard predicate on `update` may reference. These live on the
/// payload table itself (the optimistic-concurrency surface), not on any
/// index table.
pub const PAYLOAD_COLUMNS: &[&str] = &["id", "record_type", "version", "create_time", "update_time"];

// ── Index schemas ───────────────────────────────────────────────────

/// SQL type family of an index column. Drives how NULLs and bound
/// parameters are typed when writing the index row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    BigInt,
    Bool,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
}

/// The denormalized table backing one indexed record type.
#[derive(Debug, PartialEq, Eq)]
pub struct IndexSchema {
    pub table: &'static str,
    pub columns: &'static [ColumnSpec],
}

/// Meta columns every index table carries alongside its declared columns.
/// Predicates may reference these too (retention scans filter on
/// `create_time`, reclamation on `update_time`).
pub const INDEX_META_COLUMNS: &[&str] = &["base_id", "version", "create_time", "update_time"];

impl IndexSchema {
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    /// The full predicate allow-list: declared columns plus meta columns.
    pub fn allowed_columns(&self) -> Vec<&'static str> {
        self.columns
            .iter()
            .map(|c| c.name)
            .chain(INDEX_META_COLUMNS.iter().copied())
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}

static ALERT_INDEX: IndexSchema = IndexSchema {
    table: "alert_index",
    columns: &[
        ColumnSpec { name: "name", kind: ColumnKind::Text },
        ColumnSpec { name: "active", kind: ColumnKind::Bool },
        ColumnSpec { name: "last_success_time", kind: ColumnKind::Timestamp },
    ],
};

static JOB_INDEX: IndexSchema = IndexSchema {
    table: "job_index",
    columns: &[
        ColumnSpec { name: "name", kind: ColumnKind::Text },
        ColumnSpec { name: "status", kind: ColumnKind::Text },
        ColumnSpec { name: "schedule_start_time", kind: ColumnKind::Timestamp },
    ],
};

static TASK_INDEX: IndexSchema = IndexSchema {
    table: "task_index",
    columns: &[
        ColumnSpec { name: "status", kind: ColumnKind::Text },
        ColumnSpec { name: "ref_id", kind: ColumnKind::BigInt },
        ColumnSpec { name: "job_id", kind: ColumnKind::BigInt },
        ColumnSpec { name: "worker_id", kind: ColumnKind::Text },
        ColumnSpec { name: "task_type", kind: ColumnKind::Text },
        ColumnSpec { name: "start_time", kind: ColumnKind::Timestamp },
        ColumnSpec { name: "last_active", kind: ColumnKind::Timestamp },
    ],
};

// ── Registry ────────────────────────────────────────────────────────

/// Verified mapping of record types to tags and index schemas.
#[derive(Debug)]
pub struct TypeRegistry {
    // Construction goes through `standard()` so every instance is verified.
    _verified: (),
}

impl TypeRegistry {
    /// Build the standard registry and run the startup consistency check.
    pub fn standard() -> Result<Self, CoreError> {
        let registry = Self { _verified: () };
        registry.verify()?;
        Ok(registry)
    }

    /// Stable type tag stored in the payload table's `record_type` column.
    pub fn tag(&self, record_type: RecordType) -> &'static str {
        match record_type {
            RecordType::Alert => "ALERT",
            RecordType::Job => "JOB",
            RecordType::Task => "TASK",
            RecordType::Event => "EVENT",
        }
    }

    /// Reverse lookup: tag → record type.
    pub fn type_for_tag(&self, tag: &str) -> Option<RecordType> {
        RecordType::ALL.into_iter().find(|t| self.tag(*t) == tag)
    }

    /// Index schema for the type, or `None` for payload-only types.
    pub fn index_schema(&self, record_type: RecordType) -> Option<&'static IndexSchema> {
        match record_type {
            RecordType::Alert => Some(&ALERT_INDEX),
            RecordType::Job => Some(&JOB_INDEX),
            RecordType::Task => Some(&TASK_INDEX),
            RecordType::Event => None,
        }
    }

    /// Startup consistency check. A failure here is a configuration bug:
    /// abort, don't limp along.
    fn verify(&self) -> Result<(), CoreError> {
        let mut tags = HashSet::new();
        let mut tables = HashSet::new();

        for record_type in RecordType::ALL {
            let tag = self.tag(record_type);
            if tag.is_empty() {
                return Err(CoreError::Registry(format!("empty tag for {record_type}")));
            }
            if !tags.insert(tag) {
                return Err(CoreError::Registry(format!(
                    "tag '{tag}' mapped to more than one record type"
                )));
            }
            if self.type_for_tag(tag) != Some(record_type) {
                return Err(CoreError::Registry(format!(
                    "tag '{tag}' does not round-trip to {record_type}"
                )));
            }

            if let Some(schema) = self.index_schema(record_type) {
                if !tables.insert(schema.table) {
                    return Err(CoreError::Registry(format!(
                        "index table '{}' shared by more than one record type",
                        schema.table
                    )));
                }
                if schema.columns.is_empty() {
                    return Err(CoreError::Registry(format!(
                        "index table '{}' declares no columns",
                        schema.table
                    )));
                }
                let mut names = HashSet::new();
                for column in schema.columns {
                    if column.name.is_empty() || !names.insert(column.name) {
                        return Err(CoreError::Registry(format!(
                            "index table '{}' has an empty or duplicate column",
                            schema.table
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::records::{AlertRecord, JobRecord, TaskRecord, TaskType};

    #[test]
    fn standard_registry_verifies() {
        assert!(TypeRegistry::standard().is_ok());
    }

    #[test]
    fn tags_round_trip_for_all_types() {
        let registry = TypeRegistry::standard().unwrap();
        for record_type in RecordType::ALL {
            let tag = registry.tag(record_type);
            assert_eq!(registry.type_for_tag(tag), Some(record_type));
        }
    }

    #[test]
    fn unknown_tag_resolves_to_none() {
        let registry = TypeRegistry::standard().unwrap();
        assert_eq!(registry.type_for_tag("NO_SUCH_TAG"), None);
    }

    #[test]
    fn event_type_is_unindexed() {
        let registry = TypeRegistry::standard().unwrap();
        assert!(registry.index_schema(RecordType::Event).is_none());
    }

    /// The static projections in `records.rs` must line up with the schemas
    /// declared here, column for column.
    #[test]
    fn record_projections_match_schemas() {
        let registry = TypeRegistry::standard().unwrap();

        let task = TaskRecord::new(TaskType::Detection, 1, serde_json::Value::Null);
        let schema = registry.index_schema(RecordType::Task).unwrap();
        let projected: Vec<&str> = task.index_values().iter().map(|(c, _)| *c).collect();
        assert_eq!(projected, schema.column_names());

        let alert = AlertRecord {
            meta: Default::default(),
            name: "a".into(),
            active: true,
            cron: "0 * * * * *".into(),
            detection_config: serde_json::Value::Null,
            last_success_time: None,
        };
        let schema = registry.index_schema(RecordType::Alert).unwrap();
        let projected: Vec<&str> = alert.index_values().iter().map(|(c, _)| *c).collect();
        assert_eq!(projected, schema.column_names());

        let job = JobRecord {
            meta: Default::default(),
            name: "j".into(),
            status: crate::records::JobStatus::Scheduled,
            schedule_start_time: None,
        };
        let schema = registry.index_schema(RecordType::Job).unwrap();
        let projected: Vec<&str> = job.index_values().iter().map(|(c, _)| *c).collect();
        assert_eq!(projected, schema.column_names());
    }

    #[test]
    fn allowed_columns_include_meta_columns() {
        let registry = TypeRegistry::standard().unwrap();
        let schema = registry.index_schema(RecordType::Task).unwrap();
        let allowed = schema.allowed_columns();
        assert!(allowed.contains(&"status"));
        assert!(allowed.contains(&"create_time"));
        assert!(allowed.contains(&"base_id"));
    }

    #[test]
    fn payload_guard_columns_include_version() {
        assert!(PAYLOAD_COLUMNS.contains(&"id"));
        assert!(PAYLOAD_COLUMNS.contains(&"version"));
    }
}

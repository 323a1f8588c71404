//! Concrete record types: alerts, jobs, tasks, and audit events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::predicate::Value;
use crate::record::{Record, RecordMeta, RecordType};

// ── Task status ─────────────────────────────────────────────────────

/// Task lifecycle state.
///
/// `WAITING → RUNNING` via lease acquisition only; `RUNNING` reaches
/// `COMPLETED`/`FAILED` via the worker and `TIMEOUT` via the monitor sweep.
/// Terminal states allow no further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Waiting, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Timeout)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Task type ───────────────────────────────────────────────────────

/// What kind of work a task payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Detection,
    Notification,
    Replay,
    Monitor,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Detection => "DETECTION",
            TaskType::Notification => "NOTIFICATION",
            TaskType::Replay => "REPLAY",
            TaskType::Monitor => "MONITOR",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Job status ──────────────────────────────────────────────────────

/// Job lifecycle state. Jobs start SCHEDULED and are rolled up to a
/// terminal state by the monitor based on the aggregate of their tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Scheduled,
    Completed,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Scheduled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Alert ───────────────────────────────────────────────────────────

/// A detection alert configuration. Tasks reference an alert through
/// `ref_id`; the monitor's circuit-breaker deactivates alerts that keep
/// failing with no successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    #[serde(default)]
    pub meta: RecordMeta,
    pub name: String,
    pub active: bool,
    /// Cron expression consumed by the external scheduler.
    pub cron: String,
    /// Opaque detection pipeline configuration.
    #[serde(default)]
    pub detection_config: serde_json::Value,
    /// Time of the last task that completed successfully for this alert.
    #[serde(default)]
    pub last_success_time: Option<DateTime<Utc>>,
}

impl Record for AlertRecord {
    fn record_type() -> RecordType {
        RecordType::Alert
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn index_values(&self) -> Vec<(&'static str, Option<Value>)> {
        vec![
            ("name", Some(Value::Text(self.name.clone()))),
            ("active", Some(Value::Bool(self.active))),
            ("last_success_time", self.last_success_time.map(Value::Time)),
        ]
    }
}

// ── Job ─────────────────────────────────────────────────────────────

/// A grouping of tasks scheduled together (one detection window, one
/// onboarding replay, ...). Tasks reference their job by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(default)]
    pub meta: RecordMeta,
    pub name: String,
    pub status: JobStatus,
    #[serde(default)]
    pub schedule_start_time: Option<DateTime<Utc>>,
}

impl Record for JobRecord {
    fn record_type() -> RecordType {
        RecordType::Job
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn index_values(&self) -> Vec<(&'static str, Option<Value>)> {
        vec![
            ("name", Some(Value::Text(self.name.clone()))),
            ("status", Some(Value::Text(self.status.as_str().to_string()))),
            ("schedule_start_time", self.schedule_start_time.map(Value::Time)),
        ]
    }
}

// ── Task ────────────────────────────────────────────────────────────

/// One unit of asynchronous work, claimed and executed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(default)]
    pub meta: RecordMeta,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// The business entity this task acts on (e.g. an alert id); the unit
    /// of per-entity exclusivity.
    pub ref_id: i64,
    #[serde(default)]
    pub job_id: Option<i64>,
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Opaque payload handed to the task runner.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_active: Option<DateTime<Utc>>,
    /// Outcome detail set on terminal transitions.
    #[serde(default)]
    pub message: Option<String>,
}

impl TaskRecord {
    pub fn new(task_type: TaskType, ref_id: i64, payload: serde_json::Value) -> Self {
        Self {
            meta: RecordMeta::default(),
            task_type,
            status: TaskStatus::Waiting,
            ref_id,
            job_id: None,
            worker_id: None,
            payload,
            start_time: None,
            end_time: None,
            last_active: None,
            message: None,
        }
    }
}

impl Record for TaskRecord {
    fn record_type() -> RecordType {
        RecordType::Task
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn index_values(&self) -> Vec<(&'static str, Option<Value>)> {
        vec![
            ("status", Some(Value::Text(self.status.as_str().to_string()))),
            ("ref_id", Some(Value::Int(self.ref_id))),
            ("job_id", self.job_id.map(Value::Int)),
            ("worker_id", self.worker_id.clone().map(Value::Text)),
            ("task_type", Some(Value::Text(self.task_type.as_str().to_string()))),
            ("start_time", self.start_time.map(Value::Time)),
            ("last_active", self.last_active.map(Value::Time)),
        ]
    }
}

// ── Event ───────────────────────────────────────────────────────────

/// An unindexed audit event. Stored in the payload table only; readable by
/// id or listing, not filterable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(default)]
    pub meta: RecordMeta,
    pub kind: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl Record for EventRecord {
    fn record_type() -> RecordType {
        RecordType::Event
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Task state machine ──────────────────────────────────────────

    #[test]
    fn waiting_only_transitions_to_running() {
        assert!(TaskStatus::Waiting.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Waiting.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Waiting.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Waiting.can_transition_to(TaskStatus::Timeout));
    }

    #[test]
    fn running_transitions_to_terminal_only() {
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Timeout));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Waiting));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Timeout] {
            assert!(terminal.is_terminal());
            for next in [
                TaskStatus::Waiting,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Timeout,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_serializes_as_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Waiting).unwrap(),
            "\"WAITING\""
        );
        assert_eq!(
            serde_json::to_string(&JobStatus::Scheduled).unwrap(),
            "\"SCHEDULED\""
        );
    }

    // ── Serde round trips ───────────────────────────────────────────

    #[test]
    fn task_record_serde_round_trip() {
        let task = TaskRecord::new(
            TaskType::Detection,
            42,
            serde_json::json!({"window": "PT1H"}),
        );
        let json = serde_json::to_string(&task).unwrap();
        let back: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }

    #[test]
    fn alert_record_serde_defaults_meta() {
        // Payloads written before a field existed must still deserialize.
        let json = r#"{"name":"latency-p99","active":true,"cron":"0 */5 * * * *"}"#;
        let alert: AlertRecord = serde_json::from_str(json).unwrap();
        assert_eq!(alert.meta, RecordMeta::default());
        assert!(alert.last_success_time.is_none());
    }

    // ── Index projections ───────────────────────────────────────────

    #[test]
    fn task_index_projection_has_schema_order() {
        let task = TaskRecord::new(TaskType::Replay, 7, serde_json::Value::Null);
        let cols: Vec<&str> = task.index_values().iter().map(|(c, _)| *c).collect();
        assert_eq!(
            cols,
            vec![
                "status",
                "ref_id",
                "job_id",
                "worker_id",
                "task_type",
                "start_time",
                "last_active"
            ]
        );
    }

    #[test]
    fn event_record_has_empty_projection() {
        let event = EventRecord {
            meta: RecordMeta::default(),
            kind: "task.purged".to_string(),
            attributes: serde_json::Value::Null,
        };
        assert!(event.index_values().is_empty());
    }
}

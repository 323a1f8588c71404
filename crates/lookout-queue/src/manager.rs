//! Task queue over the persistence engine.
//!
//! Producers create WAITING tasks; workers claim them through
//! [`TaskManager::acquire_next_task`], which provides the two queue
//! guarantees: at most one RUNNING task per `ref_id` at any instant, and
//! FIFO per `ref_id` — a task is never leased while an older task with the
//! same `ref_id` is still WAITING or RUNNING. Global ordering across
//! `ref_id`s is deliberately not guaranteed.

use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use lookout_core::{Filter, Predicate, RecordType, TaskRecord, TaskStatus, TaskType};
use lookout_store::RecordStore;

use crate::error::QueueError;

/// The lease candidate scan.
///
/// Ordering by `base_id` (the primary key) is load-bearing: a locking scan
/// that resolves a WHERE clause plus an ORDER BY may lock or skip-lock every
/// row it visits to satisfy the ordering, and the densely indexed primary
/// key bounds that to the intended candidate set. `status` and `ref_id` are
/// indexed for the same reason — the query stays correct without them, but
/// would lock far more of the table than intended.
///
/// `SKIP LOCKED` makes concurrent callers pass over each other's locked
/// candidates instead of blocking, so N callers obtain N distinct tasks (or
/// nothing) without deadlocking. The `NOT EXISTS` clause excludes any
/// `ref_id` that already has a RUNNING task or an older WAITING one.
const ACQUIRE_CANDIDATE_SQL: &str = "
    SELECT t.base_id FROM task_index t
    WHERE t.status = 'WAITING'
      AND NOT EXISTS (
          SELECT 1 FROM task_index o
          WHERE o.ref_id = t.ref_id
            AND (o.status = 'RUNNING'
                 OR (o.status = 'WAITING' AND o.base_id < t.base_id))
      )
    ORDER BY t.base_id ASC
    LIMIT 1
    FOR UPDATE OF t SKIP LOCKED";

pub struct TaskManager {
    store: RecordStore,
}

impl TaskManager {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    // ── Producer interface ──────────────────────────────────────────

    /// Enqueue a new WAITING task and return its id.
    pub async fn create_task(
        &self,
        payload: serde_json::Value,
        ref_id: i64,
        task_type: TaskType,
        job_id: Option<i64>,
    ) -> Result<i64, QueueError> {
        let mut task = TaskRecord::new(task_type, ref_id, payload);
        task.job_id = job_id;
        let id = self.store.create(&mut task).await?;
        debug!(task_id = id, ref_id, task_type = %task_type, "task enqueued");
        Ok(id)
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    // ── Worker interface ────────────────────────────────────────────

    /// Claim the next runnable task for this worker, or `None` when no task
    /// is eligible — callers poll. Errors are surfaced, never folded into
    /// `None`: a failed lease attempt must stay distinguishable from an
    /// empty queue.
    pub async fn acquire_next_task(
        &self,
        worker_id: &str,
    ) -> Result<Option<TaskRecord>, QueueError> {
        let mut tx = self.store.pool().begin().await?;

        let candidate: Option<i64> = sqlx::query_scalar(ACQUIRE_CANDIDATE_SQL)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(id) = candidate else {
            return Ok(None);
        };

        let mut task: TaskRecord = self.store.get_in(&mut tx, id).await?.ok_or_else(|| {
            QueueError::LostLease(format!("locked task {id} has no payload row"))
        })?;

        let now = Utc::now();
        task.status = TaskStatus::Running;
        task.worker_id = Some(worker_id.to_string());
        task.start_time = Some(now);
        task.last_active = Some(now);

        let rows = self.store.update_in(&mut tx, &mut task, None).await?;
        if rows != 1 {
            error!(task_id = id, rows, "lease update affected an unexpected row count");
            return Err(QueueError::LostLease(format!(
                "lease update for task {id} affected {rows} rows"
            )));
        }
        tx.commit().await?;

        info!(task_id = id, worker_id, ref_id = task.ref_id, "task leased");
        Ok(Some(task))
    }

    /// Transition a RUNNING task to a terminal status. A task that is not
    /// RUNNING anymore (e.g. already reclaimed by the monitor) is left
    /// untouched.
    pub async fn complete_task(
        &self,
        id: i64,
        status: TaskStatus,
        message: Option<String>,
    ) -> Result<(), QueueError> {
        if !status.is_terminal() {
            return Err(QueueError::InvalidTransition {
                from: TaskStatus::Running,
                to: status,
            });
        }
        self.update_status(id, TaskStatus::Running, status, message)
            .await
    }

    /// Transition a task from `expected` to `next`, stamping `end_time` and
    /// `message`. No-op (logged) when the task is absent or its current
    /// status does not match `expected`.
    pub async fn update_status(
        &self,
        id: i64,
        expected: TaskStatus,
        next: TaskStatus,
        message: Option<String>,
    ) -> Result<(), QueueError> {
        let Some(mut task) = self.store.get::<TaskRecord>(id).await? else {
            warn!(task_id = id, "status update for a task that no longer exists");
            return Ok(());
        };
        if task.status != expected {
            warn!(
                task_id = id,
                current = %task.status,
                expected = %expected,
                "status update skipped, task moved on"
            );
            return Ok(());
        }
        task.status = next;
        task.end_time = Some(Utc::now());
        task.message = message;
        self.store.update(&mut task).await?;
        info!(task_id = id, status = %next, "task status updated");
        Ok(())
    }

    /// Bump `last_active` on a RUNNING task. Workers call this on a fixed
    /// interval while executing.
    pub async fn heartbeat(&self, id: i64) -> Result<(), QueueError> {
        if let Some(mut task) = self.store.get::<TaskRecord>(id).await? {
            if task.status == TaskStatus::Running {
                task.last_active = Some(Utc::now());
                self.store.update(&mut task).await?;
            }
        }
        Ok(())
    }

    // ── Monitor-facing queries ──────────────────────────────────────

    /// RUNNING tasks whose `start_time` is older than `max_run_time`,
    /// restricted to the retention window.
    pub async fn find_timeout_tasks(
        &self,
        retention: Duration,
        max_run_time: Duration,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        let now = Utc::now();
        let stale_cutoff = now - chrono_duration(max_run_time);
        let retention_cutoff = now - chrono_duration(retention);
        let filter = Filter::new(
            RecordType::Task,
            Predicate::and(vec![
                Predicate::eq("status", TaskStatus::Running.as_str()),
                Predicate::lt("start_time", stale_cutoff),
                Predicate::ge("create_time", retention_cutoff),
            ]),
        );
        Ok(self.store.filter(&filter).await?)
    }

    /// Tasks in `status` created within the window.
    pub async fn find_by_status_within(
        &self,
        status: TaskStatus,
        window: Duration,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        let cutoff = Utc::now() - chrono_duration(window);
        let filter = Filter::new(
            RecordType::Task,
            Predicate::and(vec![
                Predicate::eq("status", status.as_str()),
                Predicate::ge("create_time", cutoff),
            ]),
        );
        Ok(self.store.filter(&filter).await?)
    }

    pub async fn count_by_status(&self, status: TaskStatus) -> Result<i64, QueueError> {
        Ok(self
            .store
            .count::<TaskRecord>(Some(&Predicate::eq("status", status.as_str())))
            .await?)
    }

    /// Delete tasks in a terminal status created before the retention
    /// cutoff, at most `limit` per call.
    pub async fn purge_terminal_older_than(
        &self,
        status: TaskStatus,
        retention: Duration,
        limit: i64,
    ) -> Result<u64, QueueError> {
        if !status.is_terminal() {
            return Err(QueueError::NotTerminal(status));
        }
        let cutoff = Utc::now() - chrono_duration(retention);
        let filter = Filter::new(
            RecordType::Task,
            Predicate::and(vec![
                Predicate::eq("status", status.as_str()),
                Predicate::lt("create_time", cutoff),
            ]),
        )
        .with_limit(limit);
        let ids = self.store.filter_ids(&filter).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let deleted = self.store.delete_many::<TaskRecord>(&ids).await?;
        info!(deleted, status = %status, "purged expired tasks");
        Ok(deleted)
    }
}

fn chrono_duration(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::MAX)
}

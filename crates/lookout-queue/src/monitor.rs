//! Periodic reconciliation sweep.
//!
//! Runs on its own schedule, independent of leasing. Each pass reclaims
//! stuck RUNNING tasks (the liveness counterpart of per-`ref_id`
//! exclusivity — without it a crashed worker would hold its `ref_id`
//! forever), rolls derived job state up from task state, purges expired
//! terminal records, and trips the circuit breaker on alerts that keep
//! failing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use lookout_core::config::MonitorConfig;
use lookout_core::{
    AlertRecord, Filter, JobRecord, JobStatus, Predicate, Record, RecordType, TaskStatus,
};
use lookout_store::RecordStore;

use crate::error::QueueError;
use crate::manager::TaskManager;

/// What one sweep pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed_tasks: usize,
    pub jobs_rolled_up: usize,
    pub purged_tasks: u64,
    pub purged_jobs: u64,
    pub disabled_alerts: usize,
}

pub struct Monitor {
    manager: Arc<TaskManager>,
    store: RecordStore,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(manager: Arc<TaskManager>, store: RecordStore, config: MonitorConfig) -> Self {
        Self {
            manager,
            store,
            config,
        }
    }

    /// Sweep loop. A failing pass is logged and the loop continues; the
    /// next interval gets another chance.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval_secs, "monitor started");
        let mut ticker = tokio::time::interval(self.config.interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "monitor sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("monitor stopped");
                    break;
                }
            }
        }
    }

    /// One full pass: reclaim, roll up, purge, circuit-break.
    pub async fn run_once(&self) -> Result<SweepReport, QueueError> {
        let report = SweepReport {
            reclaimed_tasks: self.reclaim_stale_runs().await?,
            jobs_rolled_up: self.rollup_jobs().await?,
            purged_tasks: self.purge_expired_tasks().await?,
            purged_jobs: self.purge_expired_jobs().await?,
            disabled_alerts: self.disable_failing_alerts().await?,
        };
        info!(
            reclaimed = report.reclaimed_tasks,
            jobs = report.jobs_rolled_up,
            purged_tasks = report.purged_tasks,
            purged_jobs = report.purged_jobs,
            disabled_alerts = report.disabled_alerts,
            "monitor sweep complete"
        );
        Ok(report)
    }

    // ── Stale-run reclamation ───────────────────────────────────────

    /// RUNNING tasks older than the max task duration are moved to TIMEOUT;
    /// their owning worker is presumed dead and their `ref_id` becomes
    /// leasable again.
    async fn reclaim_stale_runs(&self) -> Result<usize, QueueError> {
        let stale = self
            .manager
            .find_timeout_tasks(self.config.retention(), self.config.max_task_run_time())
            .await?;
        for task in &stale {
            let Some(id) = task.id() else { continue };
            self.manager
                .update_status(
                    id,
                    TaskStatus::Running,
                    TaskStatus::Timeout,
                    Some(format!(
                        "reclaimed by monitor, worker {} presumed dead",
                        task.worker_id.as_deref().unwrap_or("<unknown>")
                    )),
                )
                .await?;
        }
        if !stale.is_empty() {
            warn!(count = stale.len(), "reclaimed stale RUNNING tasks");
        }
        Ok(stale.len())
    }

    // ── Job rollup ──────────────────────────────────────────────────

    /// Non-terminal jobs within the retention window are marked TIMEOUT,
    /// FAILED, or COMPLETED based on their tasks' aggregate status. Jobs
    /// that still have WAITING or RUNNING tasks are left alone.
    async fn rollup_jobs(&self) -> Result<usize, QueueError> {
        let retention = self.config.retention();
        let cutoff = Utc::now() - chrono_duration(retention);

        let filter = Filter::new(
            RecordType::Job,
            Predicate::and(vec![
                Predicate::eq("status", JobStatus::Scheduled.as_str()),
                Predicate::ge("create_time", cutoff),
            ]),
        );
        let scheduled: Vec<JobRecord> = self.store.filter(&filter).await?;
        if scheduled.is_empty() {
            return Ok(0);
        }
        let mut scheduled: HashMap<i64, JobRecord> = scheduled
            .into_iter()
            .filter_map(|job| job.id().map(|id| (id, job)))
            .collect();

        // Jobs with live tasks are not rolled up yet.
        for status in [TaskStatus::Waiting, TaskStatus::Running] {
            for id in self.job_ids_with_task_status(status, retention).await? {
                scheduled.remove(&id);
            }
        }

        let mut rolled_up = 0;
        let timeout_jobs = self
            .job_ids_with_task_status(TaskStatus::Timeout, retention)
            .await?;
        rolled_up += self
            .mark_jobs(&mut scheduled, &timeout_jobs, JobStatus::Timeout)
            .await?;

        let failed_jobs = self
            .job_ids_with_task_status(TaskStatus::Failed, retention)
            .await?;
        rolled_up += self
            .mark_jobs(&mut scheduled, &failed_jobs, JobStatus::Failed)
            .await?;

        // Whatever remains has only COMPLETED tasks.
        let remaining: HashSet<i64> = scheduled.keys().copied().collect();
        rolled_up += self
            .mark_jobs(&mut scheduled, &remaining, JobStatus::Completed)
            .await?;

        Ok(rolled_up)
    }

    async fn job_ids_with_task_status(
        &self,
        status: TaskStatus,
        window: std::time::Duration,
    ) -> Result<HashSet<i64>, QueueError> {
        let tasks = self.manager.find_by_status_within(status, window).await?;
        Ok(tasks.into_iter().filter_map(|t| t.job_id).collect())
    }

    async fn mark_jobs(
        &self,
        scheduled: &mut HashMap<i64, JobRecord>,
        ids: &HashSet<i64>,
        status: JobStatus,
    ) -> Result<usize, QueueError> {
        let mut marked = 0;
        for id in ids {
            let Some(mut job) = scheduled.remove(id) else {
                continue;
            };
            job.status = status;
            self.store.update(&mut job).await?;
            info!(job_id = *id, status = %status, "job rolled up");
            marked += 1;
        }
        Ok(marked)
    }

    // ── Retention purge ─────────────────────────────────────────────

    /// Tasks are purged before jobs: tasks reference their owning job and
    /// the engine does not cascade.
    async fn purge_expired_tasks(&self) -> Result<u64, QueueError> {
        let mut purged = 0;
        for status in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Timeout] {
            purged += self
                .manager
                .purge_terminal_older_than(
                    status,
                    self.config.retention(),
                    self.config.max_deletes_per_sweep,
                )
                .await?;
        }
        Ok(purged)
    }

    async fn purge_expired_jobs(&self) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - chrono_duration(self.config.retention());
        let mut purged = 0;
        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Timeout] {
            let filter = Filter::new(
                RecordType::Job,
                Predicate::and(vec![
                    Predicate::eq("status", status.as_str()),
                    Predicate::lt("create_time", cutoff),
                ]),
            )
            .with_limit(self.config.max_deletes_per_sweep);
            let ids = self.store.filter_ids(&filter).await?;
            if ids.is_empty() {
                continue;
            }
            let deleted = self.store.delete_many::<JobRecord>(&ids).await?;
            info!(deleted, status = %status, "purged expired jobs");
            purged += deleted;
        }
        Ok(purged)
    }

    // ── Owner circuit-breaker ───────────────────────────────────────

    /// Deactivate alerts that have been failing for longer than the fail
    /// window with no successful run since — a permanently broken producer
    /// must not spin workers forever.
    async fn disable_failing_alerts(&self) -> Result<usize, QueueError> {
        let filter = Filter::new(RecordType::Alert, Predicate::eq("active", true));
        let alerts: Vec<AlertRecord> = self.store.filter(&filter).await?;

        let cutoff = Utc::now() - chrono_duration(self.config.fail_window());
        let mut disabled = 0;
        for mut alert in alerts {
            let stale_update = alert
                .meta
                .update_time
                .map_or(false, |t| t <= cutoff);
            let no_recent_success = alert
                .last_success_time
                .map_or(true, |t| t <= cutoff);
            if stale_update && no_recent_success {
                alert.active = false;
                self.store.update(&mut alert).await?;
                warn!(
                    alert_id = ?alert.id(),
                    name = %alert.name,
                    fail_window_days = self.config.fail_window_days,
                    "disabled alert with no successful run inside the fail window"
                );
                disabled += 1;
            }
        }
        Ok(disabled)
    }
}

fn chrono_duration(duration: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::MAX)
}

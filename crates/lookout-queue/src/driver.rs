//! Worker driver loop.
//!
//! Each driver repeatedly leases a task, hands it to the [`TaskRunner`]
//! collaborator, and records the terminal outcome. The runner is the seam
//! to the detection pipeline executor — the queue knows nothing about what
//! a payload means. A driver that is shut down finishes its in-flight task
//! first; a driver that dies mid-task leaves recovery to the monitor sweep.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};

use lookout_core::config::WorkerConfig;
use lookout_core::{Record, TaskRecord, TaskStatus};

use crate::error::QueueError;
use crate::manager::TaskManager;

// ── Runner seam ─────────────────────────────────────────────────────

/// Executes one task payload. Implemented by the external collaborator
/// (detection pipeline, notification dispatch, ...).
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn execute(&self, task: &TaskRecord) -> Result<serde_json::Value, QueueError>;
}

/// Runner that returns the payload unchanged. Stands in for the real
/// executor in the worker binary and in tests.
pub struct EchoTaskRunner;

#[async_trait]
impl TaskRunner for EchoTaskRunner {
    async fn execute(&self, task: &TaskRecord) -> Result<serde_json::Value, QueueError> {
        Ok(task.payload.clone())
    }
}

// ── Driver ──────────────────────────────────────────────────────────

pub struct TaskDriver {
    manager: Arc<TaskManager>,
    runner: Arc<dyn TaskRunner>,
    config: WorkerConfig,
    worker_id: String,
    shutdown: watch::Receiver<bool>,
}

impl TaskDriver {
    pub fn new(
        manager: Arc<TaskManager>,
        runner: Arc<dyn TaskRunner>,
        config: WorkerConfig,
        worker_id: String,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            manager,
            runner,
            config,
            worker_id,
            shutdown,
        }
    }

    /// Poll loop: lease, execute, retire, until shutdown.
    pub async fn run(mut self) {
        info!(worker_id = %self.worker_id, "task driver started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.manager.acquire_next_task(&self.worker_id).await {
                Ok(Some(task)) => {
                    // Once leased, the task is executed to completion even
                    // if shutdown is requested meanwhile.
                    self.run_acquired_task(task).await;
                }
                Ok(None) => {
                    self.sleep(self.config.no_task_delay()).await;
                }
                Err(e) => {
                    // An error here is not "queue empty" — log it loudly so
                    // starvation is never mistaken for emptiness.
                    error!(error = %e, worker_id = %self.worker_id, "lease attempt failed");
                    self.sleep(self.config.lease_failure_delay()).await;
                }
            }
        }
        info!(worker_id = %self.worker_id, "task driver stopped");
    }

    async fn run_acquired_task(&self, task: TaskRecord) {
        let Some(id) = task.id() else {
            error!("leased task has no id");
            return;
        };
        info!(task_id = id, task_type = %task.task_type, ref_id = task.ref_id, "executing task");
        let started = Instant::now();

        let heartbeat = self.spawn_heartbeat(id);
        let result = tokio::time::timeout(
            self.config.max_task_run_time(),
            self.runner.execute(&task),
        )
        .await;
        heartbeat.abort();

        let outcome = match result {
            Ok(Ok(_output)) => self.manager.complete_task(id, TaskStatus::Completed, None).await,
            Ok(Err(e)) => {
                warn!(task_id = id, error = %e, "task execution failed");
                self.manager
                    .complete_task(id, TaskStatus::Failed, Some(e.to_string()))
                    .await
            }
            Err(_) => {
                warn!(task_id = id, "task execution timed out");
                self.manager
                    .complete_task(
                        id,
                        TaskStatus::Timeout,
                        Some(format!(
                            "execution exceeded {}s",
                            self.config.max_task_run_time_secs
                        )),
                    )
                    .await
            }
        };
        if let Err(e) = outcome {
            error!(task_id = id, error = %e, "failed to record task outcome");
        }
        info!(
            task_id = id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "task finished"
        );
    }

    fn spawn_heartbeat(&self, task_id: i64) -> tokio::task::JoinHandle<()> {
        let manager = self.manager.clone();
        let interval = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = manager.heartbeat(task_id).await {
                    warn!(task_id, error = %e, "heartbeat failed");
                }
            }
        })
    }

    /// Sleep, returning early when shutdown is signalled.
    async fn sleep(&mut self, duration: std::time::Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}

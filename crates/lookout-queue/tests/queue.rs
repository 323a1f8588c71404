//! Task queue and monitor integration tests against a real PostgreSQL
//! instance.
//!
//! Set `LOOKOUT_TEST_DATABASE_URL` to run; without it every test is a
//! no-op skip. The leasing protocol scans the whole task table, so these
//! tests serialize on a lock and truncate the record tables up front.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::{Mutex, MutexGuard};

use lookout_core::config::MonitorConfig;
use lookout_core::{
    AlertRecord, JobRecord, JobStatus, RecordMeta, TaskRecord, TaskStatus, TaskType, TypeRegistry,
};
use lookout_queue::{Monitor, TaskManager};
use lookout_store::RecordStore;

static TEST_LOCK: Mutex<()> = Mutex::const_new(());

async fn setup() -> Option<(RecordStore, Arc<TaskManager>, MutexGuard<'static, ()>)> {
    let Ok(url) = std::env::var("LOOKOUT_TEST_DATABASE_URL") else {
        eprintln!("skipping: LOOKOUT_TEST_DATABASE_URL is not set");
        return None;
    };
    let guard = TEST_LOCK.lock().await;
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("connect test database");
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    sqlx::query("TRUNCATE record_payload CASCADE")
        .execute(&pool)
        .await
        .expect("truncate record tables");

    let registry = Arc::new(TypeRegistry::standard().expect("standard registry"));
    let store = RecordStore::new(pool, registry);
    let manager = Arc::new(TaskManager::new(store.clone()));
    Some((store, manager, guard))
}

fn monitor_config(max_task_run_time_secs: u64, retention_days: u32, fail_window_days: u32) -> MonitorConfig {
    MonitorConfig {
        interval_secs: 60,
        max_task_run_time_secs,
        retention_days,
        fail_window_days,
        max_deletes_per_sweep: 10_000,
    }
}

async fn enqueue(manager: &TaskManager, ref_id: i64) -> i64 {
    manager
        .create_task(serde_json::json!({"ref": ref_id}), ref_id, TaskType::Detection, None)
        .await
        .expect("create task")
}

// ── Leasing protocol ────────────────────────────────────────────────

/// The end-to-end lease scenario: one WAITING task per ref is leased by
/// exactly one caller; a second caller sees an empty queue; after a
/// terminal transition the ref is leasable again.
#[tokio::test]
async fn lease_scenario_single_ref() {
    let Some((_store, manager, _guard)) = setup().await else { return };

    let first = enqueue(&manager, 42).await;

    let leased = manager
        .acquire_next_task("w1")
        .await
        .expect("acquire")
        .expect("task available");
    assert_eq!(leased.meta.id, Some(first));
    assert_eq!(leased.status, TaskStatus::Running);
    assert_eq!(leased.worker_id.as_deref(), Some("w1"));
    assert!(leased.start_time.is_some());
    assert_eq!(leased.meta.version, 2);

    // No other WAITING task: absent, not an error.
    let none = manager.acquire_next_task("w2").await.expect("acquire");
    assert!(none.is_none());

    manager
        .complete_task(first, TaskStatus::Failed, Some("boom".to_string()))
        .await
        .expect("complete");

    let second = enqueue(&manager, 42).await;
    let leased = manager
        .acquire_next_task("w2")
        .await
        .expect("acquire")
        .expect("task available");
    assert_eq!(leased.meta.id, Some(second));
    assert_eq!(leased.worker_id.as_deref(), Some("w2"));
}

/// FIFO per ref: the younger task is invisible while an older task with
/// the same ref is WAITING or RUNNING.
#[tokio::test]
async fn lease_respects_per_ref_fifo() {
    let Some((_store, manager, _guard)) = setup().await else { return };

    let older = enqueue(&manager, 7).await;
    let younger = enqueue(&manager, 7).await;

    let leased = manager
        .acquire_next_task("w1")
        .await
        .expect("acquire")
        .expect("task available");
    assert_eq!(leased.meta.id, Some(older));

    // While the older task is RUNNING the younger one must not surface.
    let none = manager.acquire_next_task("w2").await.expect("acquire");
    assert!(none.is_none());

    manager
        .complete_task(older, TaskStatus::Completed, None)
        .await
        .expect("complete");

    let leased = manager
        .acquire_next_task("w2")
        .await
        .expect("acquire")
        .expect("task available");
    assert_eq!(leased.meta.id, Some(younger));
}

/// Tasks on distinct refs lease independently, oldest id first.
#[tokio::test]
async fn lease_walks_distinct_refs_in_id_order() {
    let Some((_store, manager, _guard)) = setup().await else { return };

    let a = enqueue(&manager, 1).await;
    let b = enqueue(&manager, 2).await;
    let c = enqueue(&manager, 3).await;

    let mut leased_ids = Vec::new();
    for worker in ["w1", "w2", "w3"] {
        let task = manager
            .acquire_next_task(worker)
            .await
            .expect("acquire")
            .expect("task available");
        leased_ids.push(task.meta.id.expect("id"));
    }
    assert_eq!(leased_ids, vec![a, b, c]);

    let none = manager.acquire_next_task("w4").await.expect("acquire");
    assert!(none.is_none());
}

/// K concurrent callers against N waiting tasks with distinct refs obtain
/// min(K, N) distinct tasks with no duplicates and no deadlock.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_leases_yield_distinct_tasks() {
    let Some((_store, manager, _guard)) = setup().await else { return };

    const TASKS: i64 = 4;
    const CALLERS: usize = 8;
    for ref_id in 0..TASKS {
        enqueue(&manager, ref_id).await;
    }

    let mut handles = Vec::new();
    for i in 0..CALLERS {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager.acquire_next_task(&format!("w{i}")).await
        }));
    }

    let mut leased = Vec::new();
    let mut empty = 0;
    for handle in handles {
        match handle.await.expect("join").expect("acquire") {
            Some(task) => leased.push(task.meta.id.expect("id")),
            None => empty += 1,
        }
    }

    assert_eq!(leased.len(), TASKS as usize);
    assert_eq!(empty, CALLERS - TASKS as usize);
    leased.sort_unstable();
    leased.dedup();
    assert_eq!(leased.len(), TASKS as usize, "duplicate lease detected");
}

// ── Worker-side transitions ─────────────────────────────────────────

#[tokio::test]
async fn complete_rejects_non_terminal_status() {
    let Some((_store, manager, _guard)) = setup().await else { return };

    let id = enqueue(&manager, 5).await;
    manager.acquire_next_task("w1").await.expect("acquire");

    let err = manager
        .complete_task(id, TaskStatus::Running, None)
        .await
        .unwrap_err();
    assert!(matches!(err, lookout_queue::QueueError::InvalidTransition { .. }));
}

#[tokio::test]
async fn complete_is_a_noop_when_task_already_moved_on() {
    let Some((_store, manager, _guard)) = setup().await else { return };

    let id = enqueue(&manager, 5).await;
    manager.acquire_next_task("w1").await.expect("acquire");
    manager
        .complete_task(id, TaskStatus::Completed, None)
        .await
        .expect("complete");

    // Second completion attempt must not clobber the terminal state.
    manager
        .complete_task(id, TaskStatus::Failed, Some("late".to_string()))
        .await
        .expect("complete");
    let task = manager.get_task(id).await.expect("get").expect("present");
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn heartbeat_bumps_last_active() {
    let Some((_store, manager, _guard)) = setup().await else { return };

    let id = enqueue(&manager, 9).await;
    let leased = manager
        .acquire_next_task("w1")
        .await
        .expect("acquire")
        .expect("task available");
    let initial = leased.last_active.expect("last_active set on lease");

    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.heartbeat(id).await.expect("heartbeat");

    let task = manager.get_task(id).await.expect("get").expect("present");
    assert!(task.last_active.expect("last_active") > initial);
}

// ── Monitor sweep ───────────────────────────────────────────────────

/// A RUNNING task older than the max task duration is reclaimed as
/// TIMEOUT, and its ref becomes leasable again.
#[tokio::test]
async fn monitor_reclaims_stale_running_task() {
    let Some((store, manager, _guard)) = setup().await else { return };

    let stuck = enqueue(&manager, 11).await;
    manager.acquire_next_task("w-dead").await.expect("acquire");
    let blocked = enqueue(&manager, 11).await;

    // The RUNNING task holds the ref exclusive.
    assert!(manager.acquire_next_task("w2").await.expect("acquire").is_none());

    // Max run time of zero makes the fresh RUNNING task immediately stale.
    let monitor = Monitor::new(manager.clone(), store.clone(), monitor_config(0, 30, 30));
    let report = monitor.run_once().await.expect("sweep");
    assert_eq!(report.reclaimed_tasks, 1);

    let task = manager.get_task(stuck).await.expect("get").expect("present");
    assert_eq!(task.status, TaskStatus::Timeout);
    assert!(task.message.as_deref().unwrap_or_default().contains("w-dead"));

    let leased = manager
        .acquire_next_task("w2")
        .await
        .expect("acquire")
        .expect("ref leasable again");
    assert_eq!(leased.meta.id, Some(blocked));
}

#[tokio::test]
async fn monitor_rolls_jobs_up_from_task_state() {
    let Some((store, manager, _guard)) = setup().await else { return };

    let mut jobs = Vec::new();
    for name in ["done", "broken", "stuck", "pending"] {
        let mut job = JobRecord {
            meta: RecordMeta::default(),
            name: name.to_string(),
            status: JobStatus::Scheduled,
            schedule_start_time: None,
        };
        store.create(&mut job).await.expect("create job");
        jobs.push(job);
    }
    let job_id = |i: usize| jobs[i].meta.id;

    for (i, status) in [
        (0usize, TaskStatus::Completed),
        (1, TaskStatus::Failed),
        (2, TaskStatus::Timeout),
        (3, TaskStatus::Waiting),
    ] {
        let mut task = TaskRecord::new(TaskType::Detection, 100 + i as i64, serde_json::Value::Null);
        task.status = status;
        task.job_id = job_id(i);
        store.create(&mut task).await.expect("create task");
    }

    let monitor = Monitor::new(manager.clone(), store.clone(), monitor_config(6 * 3600, 30, 30));
    let report = monitor.run_once().await.expect("sweep");
    assert_eq!(report.jobs_rolled_up, 3);

    let expected = [
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Timeout,
        JobStatus::Scheduled, // still has a WAITING task
    ];
    for (i, expected_status) in expected.iter().enumerate() {
        let job: JobRecord = store
            .get(job_id(i).expect("id"))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(job.status, *expected_status, "job '{}'", job.name);
    }
}

/// Retention purge removes terminal tasks and jobs; tasks go first since
/// they reference their owning job.
#[tokio::test]
async fn monitor_purges_expired_terminal_records() {
    let Some((store, manager, _guard)) = setup().await else { return };

    let mut job = JobRecord {
        meta: RecordMeta::default(),
        name: "expired".to_string(),
        status: JobStatus::Completed,
        schedule_start_time: None,
    };
    let job_id = store.create(&mut job).await.expect("create job");

    let mut done = TaskRecord::new(TaskType::Detection, 21, serde_json::Value::Null);
    done.status = TaskStatus::Completed;
    done.job_id = Some(job_id);
    let done_id = store.create(&mut done).await.expect("create task");

    let waiting = enqueue(&manager, 22).await;

    // Zero retention expires everything terminal; max run time stays high
    // so the reclamation step does not interfere.
    let monitor = Monitor::new(manager.clone(), store.clone(), monitor_config(6 * 3600, 0, 30));
    let report = monitor.run_once().await.expect("sweep");
    assert_eq!(report.purged_tasks, 1);
    assert_eq!(report.purged_jobs, 1);

    assert!(manager.get_task(done_id).await.expect("get").is_none());
    let job: Option<JobRecord> = store.get(job_id).await.expect("get");
    assert!(job.is_none());

    // Non-terminal records survive the purge.
    assert!(manager.get_task(waiting).await.expect("get").is_some());
}

#[tokio::test]
async fn monitor_disables_chronically_failing_alerts() {
    let Some((store, manager, _guard)) = setup().await else { return };

    let mut alert = AlertRecord {
        meta: RecordMeta::default(),
        name: "flappy".to_string(),
        active: true,
        cron: "0 */5 * * * *".to_string(),
        detection_config: serde_json::Value::Null,
        last_success_time: None,
    };
    let alert_id = store.create(&mut alert).await.expect("create alert");

    // A wide fail window leaves the fresh alert alone.
    let monitor = Monitor::new(manager.clone(), store.clone(), monitor_config(6 * 3600, 30, 30));
    let report = monitor.run_once().await.expect("sweep");
    assert_eq!(report.disabled_alerts, 0);

    // A zero-width window trips the breaker: no successful run since the
    // cutoff and no recent update either.
    let monitor = Monitor::new(manager.clone(), store.clone(), monitor_config(6 * 3600, 30, 0));
    let report = monitor.run_once().await.expect("sweep");
    assert_eq!(report.disabled_alerts, 1);

    let alert: AlertRecord = store.get(alert_id).await.expect("get").expect("present");
    assert!(!alert.active);

    // Already-inactive alerts are not revisited.
    let report = monitor.run_once().await.expect("sweep");
    assert_eq!(report.disabled_alerts, 0);
}

#[tokio::test]
async fn lease_count_by_status_reflects_queue_state() {
    let Some((_store, manager, _guard)) = setup().await else { return };

    enqueue(&manager, 31).await;
    enqueue(&manager, 32).await;
    assert_eq!(manager.count_by_status(TaskStatus::Waiting).await.expect("count"), 2);

    manager.acquire_next_task("w1").await.expect("acquire");
    assert_eq!(manager.count_by_status(TaskStatus::Waiting).await.expect("count"), 1);
    assert_eq!(manager.count_by_status(TaskStatus::Running).await.expect("count"), 1);
}

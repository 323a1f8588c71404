//! queue-worker — worker process for the task queue.
//!
//! Runs N driver loops (lease → execute → retire) plus the monitor sweep
//! against the shared store. All coordination between worker processes goes
//! through the store's row locking; run as many copies of this binary as
//! needed. The wired task runner is the echo stand-in — the real detection
//! executor plugs in through the `TaskRunner` trait.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use lookout_core::{Config, TypeRegistry};
use lookout_queue::{EchoTaskRunner, Monitor, TaskDriver, TaskManager};
use lookout_store::{init_pg_pool, RecordStore};

// ── CLI ─────────────────────────────────────────────────────────────

/// Task queue worker — leases and executes queued tasks.
#[derive(Parser, Debug)]
#[command(name = "queue-worker", version, about)]
struct Cli {
    /// Worker identity recorded on leased tasks. Defaults to a random id.
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,

    /// Number of concurrent driver loops. Overrides WORKER_DRIVER_COUNT.
    #[arg(long)]
    drivers: Option<usize>,

    /// Run only the driver loops, without the monitor sweep.
    #[arg(long, default_value_t = false)]
    no_monitor: bool,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    lookout_core::config::load_dotenv();
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(drivers) = cli.drivers {
        config.worker.driver_count = drivers;
    }

    let worker_id = cli
        .worker_id
        .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
    info!(worker_id = %worker_id, drivers = config.worker.driver_count, "queue-worker starting");

    let registry = Arc::new(TypeRegistry::standard()?);
    let pool = init_pg_pool(&config.database).await?;
    let store = RecordStore::new(pool, registry);
    let manager = Arc::new(TaskManager::new(store.clone()));
    let runner = Arc::new(EchoTaskRunner);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    for _ in 0..config.worker.driver_count {
        let driver = TaskDriver::new(
            manager.clone(),
            runner.clone(),
            config.worker.clone(),
            worker_id.clone(),
            shutdown_rx.clone(),
        );
        handles.push(tokio::spawn(driver.run()));
    }

    if cli.no_monitor {
        warn!("monitor sweep disabled, stale tasks will not be reclaimed by this process");
    } else {
        let monitor = Monitor::new(manager.clone(), store.clone(), config.monitor.clone());
        handles.push(tokio::spawn(monitor.run(shutdown_rx.clone())));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, finishing in-flight tasks");
    shutdown_tx.send(true)?;

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "task panicked during shutdown");
        }
    }
    info!("queue-worker exited cleanly");
    Ok(())
}

//! vf-worker
//!
//! Worker process: startup recovery, then one `process` loop per job type
//! with the configured concurrency, each supervising external transcoder
//! subprocesses. Shutdown is cooperative: stop dequeuing, let tracked
//! subprocesses die (`kill_on_drop`), close the pool.

pub mod handler;
pub mod transcoder;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use vf_config::AppConfig;
use vf_queue::{JobQueue, QueueConfig};
use vf_schemas::OperationType;

use crate::handler::WorkerHandler;

/// Build the queue with the worker-relevant knobs from app config.
pub fn queue_config(cfg: &AppConfig) -> QueueConfig {
    QueueConfig {
        attempts: cfg.job_attempts,
        ..QueueConfig::default()
    }
}

/// Run the worker until `shutdown` flips true.
///
/// Startup: migrate, recover unqueued operations, then fan out processing
/// loops for every job type.
pub async fn run_worker(cfg: Arc<AppConfig>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let pool = vf_db::connect(&cfg.database_url, cfg.db_pool_size)
        .await
        .context("worker db connect failed")?;
    vf_db::migrate(&pool).await?;

    let queue = JobQueue::connect(&cfg.redis_url, queue_config(&cfg))
        .await
        .context("worker redis connect failed")?;

    let recovery = vf_jobs::recover_unqueued(&pool, &queue, &cfg).await?;
    info!(
        requeued = recovery.requeued,
        failed = recovery.failed_missing_source,
        "recovery complete; starting processors"
    );

    let handler: Arc<dyn vf_queue::JobHandler> =
        Arc::new(WorkerHandler::new(pool.clone(), Arc::clone(&cfg)));

    let mut loops = Vec::new();
    for op_type in OperationType::ALL {
        loops.push(tokio::spawn(vf_queue::process(
            queue.clone(),
            op_type,
            cfg.queue_concurrency,
            Arc::clone(&handler),
            shutdown.clone(),
        )));
    }

    for l in loops {
        let _ = l.await;
    }

    pool.close().await;
    info!("worker stopped");
    Ok(())
}

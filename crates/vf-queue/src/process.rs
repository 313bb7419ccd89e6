//! The per-type worker loop: dequeue, lease-renew, dispatch to a handler,
//! settle the outcome.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use vf_schemas::OperationType;

use crate::{HandlerError, JobOutcome, JobQueue, QueuedJob};

/// Idle poll interval when the waiting set is empty.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Handed to the handler for mid-run interaction with the queue.
#[derive(Clone)]
pub struct JobContext {
    queue: JobQueue,
    job: QueuedJob,
}

impl JobContext {
    /// Report progress (percent). Callers throttle; the worker runtime
    /// limits this to every ≥5% or 2 s.
    pub async fn progress(&self, pct: u8) {
        self.queue.progress(&self.job, pct).await;
    }
}

/// A job-type handler. `run` does the work; `on_terminal` fires exactly
/// when the queue declares the failure final (attempts exhausted or a
/// terminal error), which is the hook the finalizer hangs off.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, job: &QueuedJob, ctx: &JobContext) -> Result<String, HandlerError>;

    async fn on_terminal(&self, job: &QueuedJob, error: &str);
}

/// Run `concurrency` workers for `job_type` until `shutdown` flips true.
///
/// Each worker holds at most one job; lease renewal runs on a side task
/// at half the lease interval so a long transcode never goes stale while
/// its handler is healthy.
pub async fn process(
    queue: JobQueue,
    job_type: OperationType,
    concurrency: usize,
    handler: Arc<dyn JobHandler>,
    shutdown: watch::Receiver<bool>,
) {
    let mut workers = Vec::with_capacity(concurrency);
    for slot in 0..concurrency {
        let queue = queue.clone();
        let handler = Arc::clone(&handler);
        let shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move {
            worker_loop(queue, job_type, slot, handler, shutdown).await;
        }));
    }

    for w in workers {
        let _ = w.await;
    }
    info!(job_type = job_type.as_str(), "queue processing stopped");
}

async fn worker_loop(
    queue: JobQueue,
    job_type: OperationType,
    slot: usize,
    handler: Arc<dyn JobHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let job = match queue.dequeue(job_type).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                // Nothing waiting; sleep unless shutdown arrives first.
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }
            Err(e) => {
                error!(job_type = job_type.as_str(), slot, error = %e, "dequeue failed");
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
        };

        run_one(&queue, &*handler, job).await;
    }
}

async fn run_one(queue: &JobQueue, handler: &dyn JobHandler, job: QueuedJob) {
    queue.publish_started(&job).await;

    // Renew the lease at half its interval until the handler settles.
    let renewer = {
        let queue = queue.clone();
        let job = job.clone();
        let interval = queue.config().lease / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if let Err(e) = queue.renew_lease(&job).await {
                    warn!(job_id = job.job_id, error = %e, "lease renew failed");
                }
            }
        })
    };

    let ctx = JobContext {
        queue: queue.clone(),
        job: job.clone(),
    };
    let result = handler.run(&job, &ctx).await;
    renewer.abort();

    match result {
        Ok(result_path) => {
            if let Err(e) = queue.complete(&job, &result_path).await {
                error!(job_id = job.job_id, error = %e, "complete failed");
            }
        }
        Err(HandlerError::Terminal(msg)) => {
            warn!(job_id = job.job_id, error = msg, "terminal job failure");
            if let Err(e) = queue.fail_terminal(&job, &msg).await {
                error!(job_id = job.job_id, error = %e, "fail_terminal failed");
            }
            handler.on_terminal(&job, &msg).await;
        }
        Err(HandlerError::Retryable(msg)) => {
            warn!(
                job_id = job.job_id,
                attempt = job.attempts_made + 1,
                error = msg,
                "retryable job failure"
            );
            match queue.fail(&job, &msg).await {
                Ok(JobOutcome::Terminal) => handler.on_terminal(&job, &msg).await,
                Ok(JobOutcome::Retry { .. }) => {}
                Err(e) => error!(job_id = job.job_id, error = %e, "fail failed"),
            }
        }
    }
}

//! Scenario: queue ordering, retry parking and stall reclaim.
//!
//! # Invariants under test
//! - Across priority classes, higher priority is strictly preferred; FIFO
//!   inside a class.
//! - A retryable failure parks the job on the delayed set with backoff
//!   `base · 2^(attempt−1)` and it comes back after the delay.
//! - Attempts exhausted → terminal; the job lands on the failed list.
//! - A job whose lease expires without renewal is reclaimed (stall) and
//!   redelivered.
//! - Completed/failed retention lists are trimmed.
//!
//! Each test namespaces its keys with a unique prefix, so a shared Redis
//! is fine. All tests skip gracefully when `VF_REDIS_URL` is not set.

use std::time::Duration;

use uuid::Uuid;
use vf_queue::{JobOutcome, JobQueue, QueueConfig};
use vf_schemas::events::{JobPayload, TraceContext, TraceEnvelope};
use vf_schemas::{AssetKind, OperationParameters, OperationType, Priority};

fn redis_url() -> String {
    std::env::var("VF_REDIS_URL")
        .expect("queue tests require VF_REDIS_URL; run: VF_REDIS_URL=redis://127.0.0.1/ cargo test -p vf-queue -- --include-ignored")
}

fn test_config() -> QueueConfig {
    QueueConfig {
        prefix: format!("vfq-test-{}", Uuid::new_v4().simple()),
        attempts: 2,
        lease: Duration::from_millis(300),
        backoff_base: Duration::from_millis(100),
        max_stalls: 2,
        completed_retention: 3,
        failed_retention: 3,
    }
}

fn envelope(tag: u32) -> TraceEnvelope<JobPayload> {
    TraceEnvelope {
        trace: TraceContext::new(Uuid::new_v4()),
        payload: JobPayload {
            operation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            asset_kind: AssetKind::Video,
            asset_id: Uuid::new_v4(),
            op_type: OperationType::Resize,
            parameters: OperationParameters::Resize {
                width: 100 + tag,
                height: 100,
            },
            source_path: format!("/tmp/in-{tag}.mp4"),
        },
    }
}

#[tokio::test]
#[ignore = "requires VF_REDIS_URL; run: VF_REDIS_URL=redis://127.0.0.1/ cargo test -p vf-queue -- --include-ignored"]
async fn priority_beats_age_and_fifo_within_class() -> anyhow::Result<()> {
    let queue = JobQueue::connect(&redis_url(), test_config()).await?;

    let low = queue.enqueue(envelope(1), Priority::Low).await?;
    let normal_1 = queue.enqueue(envelope(2), Priority::Normal).await?;
    let normal_2 = queue.enqueue(envelope(3), Priority::Normal).await?;
    let high = queue.enqueue(envelope(4), Priority::High).await?;

    let mut order = Vec::new();
    while let Some(job) = queue.dequeue(OperationType::Resize).await? {
        order.push(job.job_id.clone());
        queue.complete(&job, "/tmp/out.mp4").await?;
    }

    assert_eq!(
        order,
        vec![high, normal_1, normal_2, low],
        "strict priority first, FIFO inside the class"
    );

    Ok(())
}

#[tokio::test]
#[ignore = "requires VF_REDIS_URL; run: VF_REDIS_URL=redis://127.0.0.1/ cargo test -p vf-queue -- --include-ignored"]
async fn retryable_failure_parks_then_redelivers() -> anyhow::Result<()> {
    let queue = JobQueue::connect(&redis_url(), test_config()).await?;
    let job_id = queue.enqueue(envelope(1), Priority::Normal).await?;

    let job = queue.dequeue(OperationType::Resize).await?.unwrap();
    assert_eq!(job.job_id, job_id);
    assert_eq!(job.attempts_made, 0);

    let outcome = queue.fail(&job, "transient transcoder crash").await?;
    assert_eq!(
        outcome,
        JobOutcome::Retry {
            attempt: 1,
            delay: Duration::from_millis(100)
        }
    );

    // Not ready yet.
    assert!(queue.dequeue(OperationType::Resize).await?.is_none());
    let stats = queue.stats(OperationType::Resize).await?;
    assert_eq!(stats.delayed, 1);

    // After the backoff it comes back with the attempt recorded.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let retried = queue.dequeue(OperationType::Resize).await?.unwrap();
    assert_eq!(retried.job_id, job_id);
    assert_eq!(retried.attempts_made, 1);

    // Second failure exhausts attempts (config allows 2).
    let outcome = queue.fail(&retried, "crash again").await?;
    assert_eq!(outcome, JobOutcome::Terminal);
    let stats = queue.stats(OperationType::Resize).await?;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.waiting + stats.delayed + stats.processing, 0);

    Ok(())
}

#[tokio::test]
#[ignore = "requires VF_REDIS_URL; run: VF_REDIS_URL=redis://127.0.0.1/ cargo test -p vf-queue -- --include-ignored"]
async fn expired_lease_is_reclaimed_as_stall() -> anyhow::Result<()> {
    let queue = JobQueue::connect(&redis_url(), test_config()).await?;
    let job_id = queue.enqueue(envelope(1), Priority::Normal).await?;

    let job = queue.dequeue(OperationType::Resize).await?.unwrap();
    assert_eq!(job.job_id, job_id);

    // Let the 300 ms lease lapse without renewal.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let redelivered = queue.dequeue(OperationType::Resize).await?.unwrap();
    assert_eq!(
        redelivered.job_id, job_id,
        "stalled job must be redelivered to the next worker"
    );

    // A renewed lease is NOT reclaimed.
    queue.renew_lease(&redelivered).await?;
    assert!(queue.dequeue(OperationType::Resize).await?.is_none());

    Ok(())
}

#[tokio::test]
#[ignore = "requires VF_REDIS_URL; run: VF_REDIS_URL=redis://127.0.0.1/ cargo test -p vf-queue -- --include-ignored"]
async fn terminal_failure_bypasses_remaining_attempts() -> anyhow::Result<()> {
    let queue = JobQueue::connect(&redis_url(), test_config()).await?;
    queue.enqueue(envelope(1), Priority::Normal).await?;

    let job = queue.dequeue(OperationType::Resize).await?.unwrap();
    queue.fail_terminal(&job, "source file missing").await?;

    let stats = queue.stats(OperationType::Resize).await?;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.delayed, 0, "terminal failures never park for retry");

    Ok(())
}

#[tokio::test]
#[ignore = "requires VF_REDIS_URL; run: VF_REDIS_URL=redis://127.0.0.1/ cargo test -p vf-queue -- --include-ignored"]
async fn retention_lists_are_trimmed() -> anyhow::Result<()> {
    let queue = JobQueue::connect(&redis_url(), test_config()).await?;

    // Retention is 3 in the test config; push 5 completions through.
    for i in 0..5 {
        queue.enqueue(envelope(i), Priority::Normal).await?;
        let job = queue.dequeue(OperationType::Resize).await?.unwrap();
        queue.complete(&job, "/tmp/out.mp4").await?;
    }

    let stats = queue.stats(OperationType::Resize).await?;
    assert_eq!(stats.completed, 3, "completed list must be trimmed");

    Ok(())
}

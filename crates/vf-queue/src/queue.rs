//! The queue adapter itself.

use anyhow::{Context, Result};
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use vf_schemas::events::{JobPayload, QueueEvent, QueueNotice, TraceEnvelope};
use vf_schemas::{OperationType, Priority};

use crate::{waiting_score, JobOutcome, QueueConfig};

/// Pub/sub channel suffix carrying [`QueueNotice`] JSON; the full channel
/// is `<prefix>:events` (`vfq:events` in deployments).
pub const EVENTS_CHANNEL_SUFFIX: &str = "events";

/// Job-hash TTL once a job reaches a terminal list; keeps debugging data
/// around without growing Redis forever.
const TERMINAL_HASH_TTL_SECS: i64 = 24 * 3600;

/// How many due/expired members one maintenance pass moves.
const SWEEP_BATCH: isize = 128;

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: String,
    pub job_type: OperationType,
    pub priority_class: u8,
    /// Attempts consumed before this run (0 on first delivery).
    pub attempts_made: u32,
    pub envelope: TraceEnvelope<JobPayload>,
}

impl QueuedJob {
    pub fn notice(&self, event: QueueEvent) -> QueueNotice {
        QueueNotice {
            job_id: self.job_id.clone(),
            operation_id: self.envelope.payload.operation_id,
            asset_kind: self.envelope.payload.asset_kind,
            asset_id: self.envelope.payload.asset_id,
            op_type: self.envelope.payload.op_type,
            at: Utc::now(),
            event,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct JobQueue {
    conn: ConnectionManager,
    cfg: QueueConfig,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}


impl JobQueue {
    pub async fn connect(redis_url: &str, cfg: QueueConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("redis connect failed")?;
        Ok(Self { conn, cfg })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    /// Full pub/sub channel name for queue notices.
    pub fn events_channel(&self) -> String {
        format!("{}:{}", self.cfg.prefix, EVENTS_CHANNEL_SUFFIX)
    }

    fn k_seq(&self) -> String {
        format!("{}:seq", self.cfg.prefix)
    }
    fn k_waiting(&self, t: OperationType) -> String {
        format!("{}:{}:waiting", self.cfg.prefix, t.as_str())
    }
    fn k_delayed(&self, t: OperationType) -> String {
        format!("{}:{}:delayed", self.cfg.prefix, t.as_str())
    }
    fn k_processing(&self, t: OperationType) -> String {
        format!("{}:{}:processing", self.cfg.prefix, t.as_str())
    }
    fn k_completed(&self, t: OperationType) -> String {
        format!("{}:{}:completed", self.cfg.prefix, t.as_str())
    }
    fn k_failed(&self, t: OperationType) -> String {
        format!("{}:{}:failed", self.cfg.prefix, t.as_str())
    }
    fn k_job(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.cfg.prefix, job_id)
    }

    // -----------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------

    /// Enqueue a job; returns the queue job id. Emits `Queued`.
    pub async fn enqueue(
        &self,
        envelope: TraceEnvelope<JobPayload>,
        priority: Priority,
    ) -> Result<String> {
        let mut conn = self.conn.clone();
        let job_type = envelope.payload.op_type;

        let seq: u64 = conn.incr(self.k_seq(), 1).await.context("seq incr failed")?;
        let job_id = seq.to_string();

        let envelope_json =
            serde_json::to_string(&envelope).context("envelope serialization failed")?;

        let _: () = conn.hset_multiple(
            self.k_job(&job_id),
            &[
                ("envelope", envelope_json.as_str()),
                ("type", job_type.as_str()),
                ("priority", &priority.class().to_string()),
                ("attempts", "0"),
                ("stalls", "0"),
                ("enqueued_at", &now_ms().to_string()),
            ],
        )
        .await
        .context("job hash write failed")?;

        let _: () = conn
            .zadd(
                self.k_waiting(job_type),
                &job_id,
                waiting_score(priority.class(), seq),
            )
            .await
            .context("waiting zadd failed")?;

        let job = QueuedJob {
            job_id: job_id.clone(),
            job_type,
            priority_class: priority.class(),
            attempts_made: 0,
            envelope,
        };
        self.publish_notice(&job.notice(QueueEvent::Queued)).await;

        debug!(job_id, job_type = job_type.as_str(), "job enqueued");
        Ok(job_id)
    }

    // -----------------------------------------------------------------
    // Consumer side
    // -----------------------------------------------------------------

    /// Pop the best waiting job, take a lease on it, and load its payload.
    ///
    /// Runs the two maintenance sweeps first so due retries and stalled
    /// jobs re-enter the waiting set before selection.
    pub async fn dequeue(&self, job_type: OperationType) -> Result<Option<QueuedJob>> {
        self.promote_due(job_type).await?;
        self.reap_stalled(job_type).await?;

        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = conn
            .zpopmin(self.k_waiting(job_type), 1)
            .await
            .context("waiting zpopmin failed")?;
        let Some((job_id, _score)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let deadline = now_ms() + self.cfg.lease.as_millis() as i64;
        let _: () = conn
            .zadd(self.k_processing(job_type), &job_id, deadline)
            .await
            .context("processing zadd failed")?;

        match self.load_job(&job_id).await? {
            Some(job) => Ok(Some(job)),
            None => {
                // Hash vanished (trimmed or manually deleted); drop the
                // orphan lease and move on.
                warn!(job_id, "dequeued job without payload hash; discarding");
                let _: () = conn
                    .zrem(self.k_processing(job_type), &job_id)
                    .await
                    .context("orphan zrem failed")?;
                Ok(None)
            }
        }
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<QueuedJob>> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> = conn
            .hgetall(self.k_job(job_id))
            .await
            .context("job hash read failed")?;
        if fields.is_empty() {
            return Ok(None);
        }

        let envelope_json = fields
            .get("envelope")
            .context("job hash missing envelope")?;
        let envelope: TraceEnvelope<JobPayload> =
            serde_json::from_str(envelope_json).context("envelope parse failed")?;

        let job_type = OperationType::parse(fields.get("type").map(String::as_str).unwrap_or(""))
            .map_err(|e| anyhow::anyhow!(e))?;
        let attempts_made = fields
            .get("attempts")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let priority_class = fields
            .get("priority")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| Priority::Normal.class());

        Ok(Some(QueuedJob {
            job_id: job_id.to_string(),
            job_type,
            priority_class,
            attempts_made,
            envelope,
        }))
    }

    /// Extend the lease. Handlers call this every `lease / 2`.
    pub async fn renew_lease(&self, job: &QueuedJob) -> Result<()> {
        let mut conn = self.conn.clone();
        let deadline = now_ms() + self.cfg.lease.as_millis() as i64;
        let _: () = conn
            .zadd(self.k_processing(job.job_type), &job.job_id, deadline)
            .await
            .context("lease renew failed")?;
        Ok(())
    }

    /// Report progress; emitted on the events channel. Throttling is the
    /// caller's business (the worker throttles to ≥5% / 2s).
    pub async fn progress(&self, job: &QueuedJob, pct: u8) {
        self.publish_notice(&job.notice(QueueEvent::Progress { pct: pct.min(100) }))
            .await;
    }

    /// Announce handler start.
    pub async fn publish_started(&self, job: &QueuedJob) {
        self.publish_notice(&job.notice(QueueEvent::Started)).await;
    }

    /// Success: release the lease, record for retention, emit `Completed`.
    pub async fn complete(&self, job: &QueuedJob, result_path: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zrem(self.k_processing(job.job_type), &job.job_id)
            .await
            .context("complete zrem failed")?;

        let _: () = conn
            .lpush(self.k_completed(job.job_type), &job.job_id)
            .await
            .context("completed lpush failed")?;
        let _: () = conn
            .ltrim(
                self.k_completed(job.job_type),
                0,
                self.cfg.completed_retention as isize - 1,
            )
            .await
            .context("completed ltrim failed")?;
        let _: () = conn
            .expire(self.k_job(&job.job_id), TERMINAL_HASH_TTL_SECS)
            .await
            .context("job hash expire failed")?;

        self.publish_notice(&job.notice(QueueEvent::Completed {
            result_path: result_path.to_string(),
        }))
        .await;
        Ok(())
    }

    /// Handler failure: consume an attempt, then either park for retry or
    /// finish terminally.
    pub async fn fail(&self, job: &QueuedJob, error: &str) -> Result<JobOutcome> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zrem(self.k_processing(job.job_type), &job.job_id)
            .await
            .context("fail zrem failed")?;

        let attempts: i64 = conn
            .hincr(self.k_job(&job.job_id), "attempts", 1)
            .await
            .context("attempts incr failed")?;
        let attempts = attempts.max(0) as u32;

        if attempts >= self.cfg.attempts {
            self.finish_failed(job, error).await?;
            return Ok(JobOutcome::Terminal);
        }

        let delay = self.cfg.retry_delay(attempts);
        let ready_at = now_ms() + delay.as_millis() as i64;
        let _: () = conn
            .zadd(self.k_delayed(job.job_type), &job.job_id, ready_at)
            .await
            .context("delayed zadd failed")?;

        debug!(
            job_id = job.job_id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "job parked for retry"
        );
        Ok(JobOutcome::Retry {
            attempt: attempts,
            delay,
        })
    }

    /// Terminal failure regardless of attempts left (pre-flight errors,
    /// timeouts, post-flight errors).
    pub async fn fail_terminal(&self, job: &QueuedJob, error: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zrem(self.k_processing(job.job_type), &job.job_id)
            .await
            .context("fail_terminal zrem failed")?;
        self.finish_failed(job, error).await
    }

    async fn finish_failed(&self, job: &QueuedJob, error: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(self.k_failed(job.job_type), &job.job_id)
            .await
            .context("failed lpush failed")?;
        let _: () = conn
            .ltrim(
                self.k_failed(job.job_type),
                0,
                self.cfg.failed_retention as isize - 1,
            )
            .await
            .context("failed ltrim failed")?;
        let _: () = conn
            .expire(self.k_job(&job.job_id), TERMINAL_HASH_TTL_SECS)
            .await
            .context("job hash expire failed")?;

        self.publish_notice(&job.notice(QueueEvent::Failed {
            error: error.to_string(),
        }))
        .await;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Maintenance sweeps
    // -----------------------------------------------------------------

    /// Move due delayed jobs back to the waiting set. The ZREM result is
    /// the ownership token: whichever worker removes the member promotes
    /// it, so concurrent sweeps never double-promote.
    pub async fn promote_due(&self, job_type: OperationType) -> Result<()> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore_limit(self.k_delayed(job_type), "-inf", now_ms(), 0, SWEEP_BATCH)
            .await
            .context("delayed range failed")?;

        for job_id in due {
            let removed: i64 = conn
                .zrem(self.k_delayed(job_type), &job_id)
                .await
                .context("delayed zrem failed")?;
            if removed == 0 {
                continue; // another worker won this member
            }
            self.requeue_waiting(job_type, &job_id).await?;
        }
        Ok(())
    }

    /// Return lease-expired jobs to the waiting set, counting a stall.
    /// A job stalled more than `max_stalls` times consumes an attempt;
    /// when attempts are exhausted it finishes terminally (the reservation
    /// janitor settles the operation side).
    pub async fn reap_stalled(&self, job_type: OperationType) -> Result<()> {
        let mut conn = self.conn.clone();
        let expired: Vec<String> = conn
            .zrangebyscore_limit(self.k_processing(job_type), "-inf", now_ms(), 0, SWEEP_BATCH)
            .await
            .context("processing range failed")?;

        for job_id in expired {
            let removed: i64 = conn
                .zrem(self.k_processing(job_type), &job_id)
                .await
                .context("processing zrem failed")?;
            if removed == 0 {
                continue;
            }

            let stalls: i64 = conn
                .hincr(self.k_job(&job_id), "stalls", 1)
                .await
                .context("stalls incr failed")?;
            warn!(job_id, stalls, "stalled job reclaimed");

            if stalls as u32 > self.cfg.max_stalls {
                let attempts: i64 = conn
                    .hincr(self.k_job(&job_id), "attempts", 1)
                    .await
                    .context("attempts incr failed")?;
                let _: () = conn
                    .hset(self.k_job(&job_id), "stalls", 0)
                    .await
                    .context("stalls reset failed")?;

                if attempts.max(0) as u32 >= self.cfg.attempts {
                    if let Some(job) = self.load_job(&job_id).await? {
                        self.finish_failed(&job, "job stalled repeatedly").await?;
                    }
                    continue;
                }
            }

            self.requeue_waiting(job_type, &job_id).await?;
        }
        Ok(())
    }

    /// Re-add a job at the back of its priority class.
    async fn requeue_waiting(&self, job_type: OperationType, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let class: Option<String> = conn
            .hget(self.k_job(job_id), "priority")
            .await
            .context("priority read failed")?;
        let class: u8 = class
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| Priority::Normal.class());
        let seq: u64 = conn.incr(self.k_seq(), 1).await.context("seq incr failed")?;
        let _: () = conn
            .zadd(self.k_waiting(job_type), job_id, waiting_score(class, seq))
            .await
            .context("requeue zadd failed")?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------

    pub async fn stats(&self, job_type: OperationType) -> Result<QueueStats> {
        let mut conn = self.conn.clone();
        let waiting: u64 = conn.zcard(self.k_waiting(job_type)).await?;
        let delayed: u64 = conn.zcard(self.k_delayed(job_type)).await?;
        let processing: u64 = conn.zcard(self.k_processing(job_type)).await?;
        let completed: u64 = conn.llen(self.k_completed(job_type)).await?;
        let failed: u64 = conn.llen(self.k_failed(job_type)).await?;
        Ok(QueueStats {
            waiting,
            delayed,
            processing,
            completed,
            failed,
        })
    }

    /// Best-effort notice publication; the queue must not fail a job
    /// because nobody is listening.
    async fn publish_notice(&self, notice: &QueueNotice) {
        let mut conn = self.conn.clone();
        match serde_json::to_string(notice) {
            Ok(json) => {
                let res: redis::RedisResult<i64> = conn.publish(self.events_channel(), json).await;
                if let Err(e) = res {
                    warn!(error = %e, "queue notice publish failed");
                }
            }
            Err(e) => warn!(error = %e, "queue notice serialization failed"),
        }
    }
}

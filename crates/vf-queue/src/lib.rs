//! vf-queue
//!
//! Redis-backed job queue with strict priority classes, per-job leases,
//! stall detection and exponential retry backoff.
//!
//! Layout (all keys under the `vfq:` prefix):
//!
//! ```text
//! vfq:seq                  INCR counter; FIFO tiebreak within a class
//! vfq:<type>:waiting       ZSET  job_id → priority·2^44 + seq
//! vfq:<type>:delayed       ZSET  job_id → ready-at epoch millis
//! vfq:<type>:processing    ZSET  job_id → lease deadline epoch millis
//! vfq:job:<id>             HASH  envelope, type, priority, attempts, stalls
//! vfq:<type>:completed     LIST  newest-first, trimmed to 100
//! vfq:<type>:failed        LIST  newest-first, trimmed to 200
//! vfq:events               PUBSUB channel carrying QueueNotice JSON
//! ```
//!
//! A dequeued job must renew its lease before the deadline; the reaper
//! returns expired members to the waiting set and counts a stall. Stalls
//! beyond the limit consume an attempt, so a handler that silently wedges
//! cannot hold a job forever.

mod process;
mod queue;

pub use process::{process, JobContext, JobHandler};
pub use queue::{JobQueue, QueueStats, QueuedJob};

use std::time::Duration;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Key namespace. Every key this queue touches lives under
    /// `<prefix>:`; deployments share the default, tests isolate with a
    /// unique prefix per case.
    pub prefix: String,
    /// Handler attempts before a failure is terminal.
    pub attempts: u32,
    /// Lease granted per dequeue; handlers renew at half this interval.
    pub lease: Duration,
    /// Retry backoff base: attempt n waits `base · 2^(n−1)`.
    pub backoff_base: Duration,
    /// Stall detections after which a stall consumes an attempt.
    pub max_stalls: u32,
    pub completed_retention: usize,
    pub failed_retention: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: "vfq".to_string(),
            attempts: 3,
            lease: Duration::from_secs(60),
            backoff_base: Duration::from_secs(5),
            max_stalls: 2,
            completed_retention: 100,
            failed_retention: 200,
        }
    }
}

impl QueueConfig {
    /// Delay before retry `attempt` (1-based): `base · 2^(attempt−1)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.backoff_base * 2u32.pow(shift)
    }
}

// ---------------------------------------------------------------------------
// Outcomes and handler errors
// ---------------------------------------------------------------------------

/// What `fail` decided for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Parked on the delayed set; will re-run after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted (or failure declared terminal); job is done.
    Terminal,
}

/// Handler failure classification. Retryable errors consume an attempt;
/// terminal errors end the job immediately regardless of attempts left.
#[derive(Debug, Clone)]
pub enum HandlerError {
    Retryable(String),
    Terminal(String),
}

impl HandlerError {
    pub fn message(&self) -> &str {
        match self {
            HandlerError::Retryable(m) | HandlerError::Terminal(m) => m,
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Retryable(m) => write!(f, "retryable: {m}"),
            HandlerError::Terminal(m) => write!(f, "terminal: {m}"),
        }
    }
}

impl std::error::Error for HandlerError {}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Waiting-set score: strict priority classes, FIFO inside a class.
///
/// The sequence occupies the low 44 bits (stays exact in an f64 up to
/// 2^53); the class is the high factor, so any High job sorts before any
/// Normal job regardless of age.
pub(crate) fn waiting_score(priority_class: u8, seq: u64) -> f64 {
    const CLASS_STRIDE: f64 = (1u64 << 44) as f64;
    priority_class as f64 * CLASS_STRIDE + seq as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use vf_schemas::Priority;

    #[test]
    fn higher_priority_always_sorts_first() {
        let old_low = waiting_score(Priority::Low.class(), 1);
        let new_high = waiting_score(Priority::High.class(), 9_999_999);
        assert!(
            new_high < old_low,
            "a fresh high-priority job must precede the oldest low-priority job"
        );
    }

    #[test]
    fn fifo_within_a_class() {
        let first = waiting_score(Priority::Normal.class(), 10);
        let second = waiting_score(Priority::Normal.class(), 11);
        assert!(first < second);
    }

    #[test]
    fn retry_delay_doubles() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.retry_delay(1), Duration::from_secs(5));
        assert_eq!(cfg.retry_delay(2), Duration::from_secs(10));
        assert_eq!(cfg.retry_delay(3), Duration::from_secs(20));
    }
}

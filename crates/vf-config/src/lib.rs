//! vf-config
//!
//! Typed environment configuration for all vidforge processes. Binaries
//! call `dotenvy::from_filename(".env.local")` themselves before
//! [`AppConfig::from_env`]; production injects env vars directly.
//!
//! Every knob has a default except the connection URLs, which fail loudly
//! when missing so a misconfigured worker cannot silently point at the
//! wrong infrastructure.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use vf_schemas::OperationType;

pub const ENV_DB_URL: &str = "VF_DATABASE_URL";
pub const ENV_REDIS_URL: &str = "VF_REDIS_URL";
pub const ENV_AMQP_URL: &str = "VF_AMQP_URL";

/// AMQP topic exchange all durable events are published to.
pub const EVENT_EXCHANGE: &str = "vidforge.events";
/// Dead-letter exchange for consumer-side failures.
pub const DEAD_LETTER_EXCHANGE: &str = "vidforge.dlx";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub db_pool_size: u32,
    pub redis_url: String,
    pub amqp_url: String,
    pub storage_root: String,

    /// Per-type worker concurrency (simultaneous transcoder subprocesses).
    pub queue_concurrency: usize,
    /// Handler attempts before a failure is terminal.
    pub job_attempts: u32,
    pub job_timeout: Duration,
    /// Tighter wall clock for image/thumbnail operations.
    pub image_job_timeout: Duration,

    pub dispatch_interval: Duration,
    pub dispatch_batch: i64,
    pub dispatch_lease_secs: i64,
    pub dispatch_max_attempts: i32,

    pub janitor_interval: Duration,
    pub reservation_ttl: Duration,

    pub max_upload_mb_free: u64,
    pub max_upload_mb_pro: u64,

    pub transcoder_bin: String,
    /// Credit cost per operation type; anything absent costs [`Self::DEFAULT_COST`].
    pub cost_map: HashMap<OperationType, i64>,

    pub daemon_addr: Option<String>,
}

impl AppConfig {
    pub const DEFAULT_COST: i64 = 1;

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: require(ENV_DB_URL)?,
            db_pool_size: parse_or("VF_DB_POOL_SIZE", 10)?,
            redis_url: require(ENV_REDIS_URL)?,
            amqp_url: require(ENV_AMQP_URL)?,
            storage_root: std::env::var("VF_STORAGE_ROOT")
                .unwrap_or_else(|_| "./storage".to_string()),

            queue_concurrency: parse_or("VF_QUEUE_CONCURRENCY", 5)?,
            job_attempts: parse_or("VF_JOB_ATTEMPTS", 3)?,
            job_timeout: Duration::from_secs(parse_or("VF_JOB_TIMEOUT_SECS", 300)?),
            image_job_timeout: Duration::from_secs(parse_or("VF_IMAGE_JOB_TIMEOUT_SECS", 45)?),

            dispatch_interval: Duration::from_millis(parse_or("VF_DISPATCH_INTERVAL_MS", 1000)?),
            dispatch_batch: parse_or("VF_DISPATCH_BATCH", 10)?,
            dispatch_lease_secs: parse_or("VF_DISPATCH_LEASE_SECS", 60)?,
            dispatch_max_attempts: parse_or("VF_DISPATCH_MAX_ATTEMPTS", 5)?,

            janitor_interval: Duration::from_secs(parse_or("VF_JANITOR_INTERVAL_SECS", 1800)?),
            reservation_ttl: Duration::from_secs(parse_or("VF_RESERVATION_TTL_SECS", 1800)?),

            max_upload_mb_free: parse_or("VF_MAX_UPLOAD_MB_FREE", 50)?,
            max_upload_mb_pro: parse_or("VF_MAX_UPLOAD_MB_PRO", 500)?,

            transcoder_bin: std::env::var("VF_TRANSCODER_BIN")
                .unwrap_or_else(|_| "ffmpeg".to_string()),
            cost_map: parse_cost_map(std::env::var("VF_COST_MAP").ok().as_deref())?,

            daemon_addr: std::env::var("VF_DAEMON_ADDR").ok(),
        })
    }

    /// Credit cost for one operation of the given type.
    pub fn cost_of(&self, op_type: OperationType) -> i64 {
        self.cost_map
            .get(&op_type)
            .copied()
            .unwrap_or(Self::DEFAULT_COST)
    }

    /// Wall-clock timeout class for a job type.
    pub fn timeout_for(&self, op_type: OperationType) -> Duration {
        if op_type.is_short_running() {
            self.image_job_timeout
        } else {
            self.job_timeout
        }
    }

    pub fn max_upload_bytes(&self, tier: vf_schemas::UserTier) -> u64 {
        let mb = match tier {
            vf_schemas::UserTier::Free => self.max_upload_mb_free,
            vf_schemas::UserTier::Pro => self.max_upload_mb_pro,
        };
        mb * 1024 * 1024
    }
}

fn require(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing env var {key}"))
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        Err(_) => Ok(default),
    }
}

/// `VF_COST_MAP` is a JSON object keyed by operation type:
/// `{"resize": 2, "convert": 3}`. Unknown keys fail loudly: a typo in the
/// cost map must not silently fall back to the default price.
fn parse_cost_map(raw: Option<&str>) -> Result<HashMap<OperationType, i64>> {
    let mut map = HashMap::new();
    let Some(raw) = raw else { return Ok(map) };

    let parsed: HashMap<String, i64> =
        serde_json::from_str(raw).context("VF_COST_MAP is not a JSON object of integers")?;
    for (k, v) in parsed {
        let t = OperationType::parse(&k)
            .map_err(|e| anyhow::anyhow!("VF_COST_MAP: {e}"))?;
        if v <= 0 {
            anyhow::bail!("VF_COST_MAP: cost for {k} must be positive, got {v}");
        }
        map.insert(t, v);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_map_parses_and_rejects_unknown_types() {
        let map = parse_cost_map(Some(r#"{"resize": 2, "convert-image": 3}"#)).unwrap();
        assert_eq!(map.get(&OperationType::Resize), Some(&2));
        assert_eq!(map.get(&OperationType::ConvertImage), Some(&3));

        assert!(parse_cost_map(Some(r#"{"explode": 1}"#)).is_err());
        assert!(parse_cost_map(Some(r#"{"resize": 0}"#)).is_err());
        assert!(parse_cost_map(Some("not json")).is_err());
    }

    #[test]
    fn absent_cost_map_is_empty_and_defaults_apply() {
        let map = parse_cost_map(None).unwrap();
        assert!(map.is_empty());
    }
}

//! Outbox dispatcher.
//!
//! Poll loop: claim a batch under lease, publish each event to the bus
//! concurrently, mark published or failed. Multiple instances coexist:
//! `FOR UPDATE SKIP LOCKED` keeps them off each other's rows, and a
//! crashed instance's leases expire into the next claim.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures_util::future::join_all;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

use vf_bus::EventBus;
use vf_config::AppConfig;
use vf_schemas::EventEnvelope;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
}

/// `<hostname>|<pid>|<uuid>`: unique per instance, readable in `locked_by`.
pub fn dispatcher_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
    format!("{hostname}|{}|{}", std::process::id(), Uuid::new_v4())
}

fn envelope_from(row: &vf_db::OutboxEventRow) -> EventEnvelope {
    EventEnvelope {
        outbox_id: row.event_id,
        event_type: row.event_type.clone(),
        aggregate_type: row.aggregate_type.clone(),
        aggregate_id: row.aggregate_id.clone(),
        idempotency_key: row.idempotency_key.clone(),
        correlation_id: row.correlation_id.unwrap_or(row.event_id),
        occurred_at: row.created_at,
        payload: row.payload.clone(),
    }
}

/// One claim-publish-mark round. Returns what happened so callers (and
/// tests) can observe progress.
pub async fn dispatch_once(
    pool: &PgPool,
    bus: &dyn EventBus,
    cfg: &AppConfig,
    instance_id: &str,
) -> Result<DispatchReport> {
    let events =
        vf_db::outbox_claim_batch(pool, cfg.dispatch_batch, instance_id, cfg.dispatch_lease_secs)
            .await?;

    let mut report = DispatchReport {
        claimed: events.len(),
        ..Default::default()
    };
    if events.is_empty() {
        return Ok(report);
    }
    debug!(claimed = events.len(), instance_id, "outbox batch claimed");

    let results = join_all(events.iter().map(|row| async move {
        let envelope = envelope_from(row);
        match bus.publish(&envelope).await {
            Ok(()) => {
                let marked = vf_db::outbox_mark_published(pool, row.event_id).await;
                match marked {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        // Lease expired mid-publish and someone else owns
                        // the row now; at-least-once covers the overlap.
                        warn!(event_id = %row.event_id, "publish landed on a lost lease");
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(publish_err) => {
                warn!(
                    event_id = %row.event_id,
                    event_type = row.event_type,
                    error = %publish_err,
                    "event publish failed"
                );
                vf_db::outbox_mark_failed(pool, row.event_id, cfg.dispatch_max_attempts)
                    .await
                    .map(|_| false)
            }
        }
    }))
    .await;

    for r in results {
        match r {
            Ok(true) => report.published += 1,
            Ok(false) => report.failed += 1,
            Err(e) => {
                report.failed += 1;
                error!(error = %e, "outbox mark failed");
            }
        }
    }

    Ok(report)
}

/// The dispatcher loop. Polls every `dispatch_interval`; drains eagerly
/// while full batches keep coming.
pub async fn run_dispatcher(
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    cfg: Arc<AppConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let instance_id = dispatcher_id();
    tracing::info!(instance_id, "outbox dispatcher started");

    loop {
        if *shutdown.borrow() {
            return;
        }

        let started = Utc::now();
        match dispatch_once(&pool, bus.as_ref(), &cfg, &instance_id).await {
            Ok(report) => {
                if report.claimed as i64 >= cfg.dispatch_batch {
                    // Backlog: keep draining without the poll delay.
                    continue;
                }
                debug!(
                    published = report.published,
                    failed = report.failed,
                    elapsed_ms = (Utc::now() - started).num_milliseconds(),
                    "dispatch round complete"
                );
            }
            Err(e) => error!(error = %e, "dispatch round failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(cfg.dispatch_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

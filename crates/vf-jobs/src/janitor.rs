//! Reservation janitor.
//!
//! Sweeps reservations that have neither capture nor refund after the TTL
//! and settles them against the operation's actual outcome:
//!
//! - operation `completed` but unsettled (finalizer died mid-commit): capture
//! - operation `failed` but unsettled: release
//! - operation missing, or still `pending`/`processing` past 2×TTL:
//!   release and mark the operation `failed` (`janitor_stuck`)
//!
//! Everything here is idempotent via the ledger/outbox guards, so an
//! overlapping janitor run on another node is harmless.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use vf_db::ReleaseOutcome;
use vf_schemas::OperationStatus;

pub const STUCK_ERROR: &str = "janitor_stuck";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JanitorReport {
    pub scanned: usize,
    pub captured: usize,
    pub released: usize,
    pub stuck_failed: usize,
    /// Young enough to leave alone this pass.
    pub skipped: usize,
}

/// Parse the ledger-side `op-<uuid>` reference back to the operation id.
fn parse_op_ref(operation_id: &str) -> Option<Uuid> {
    operation_id
        .strip_prefix("op-")
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

/// One sweep. `ttl` is the reservation age threshold (default 30 min);
/// operations still live past `2 × ttl` are declared stuck.
pub async fn run_janitor_pass(pool: &PgPool, ttl: Duration) -> Result<JanitorReport> {
    let ttl = chrono::Duration::from_std(ttl).context("janitor ttl out of range")?;
    let cutoff = Utc::now() - ttl;
    let stuck_cutoff = Utc::now() - ttl - ttl;

    let dangling = vf_db::find_dangling_reservations(pool, cutoff).await?;
    let mut report = JanitorReport {
        scanned: dangling.len(),
        ..Default::default()
    };

    for res in dangling {
        let correlation_id = Uuid::new_v4();

        let Some(op_uuid) = parse_op_ref(&res.operation_id) else {
            warn!(
                operation_ref = res.operation_id,
                "dangling reservation with unparseable operation reference"
            );
            report.skipped += 1;
            continue;
        };

        match vf_db::fetch_operation_any(pool, op_uuid).await? {
            Some(op) if op.status == OperationStatus::Completed => {
                // Terminal without settlement: capture to match the outcome.
                vf_db::capture(pool, &res.operation_id, correlation_id)
                    .await
                    .map_err(anyhow::Error::new)
                    .context("janitor capture failed")?;
                info!(operation_id = %op_uuid, "janitor captured completed operation");
                report.captured += 1;
            }
            Some(op) if op.status == OperationStatus::Failed => {
                if let ReleaseOutcome::Released { .. } =
                    vf_db::release(pool, &res.operation_id, correlation_id)
                        .await
                        .map_err(anyhow::Error::new)
                        .context("janitor release failed")?
                {
                    info!(operation_id = %op_uuid, "janitor released failed operation");
                    report.released += 1;
                } else {
                    report.skipped += 1;
                }
            }
            Some(op) => {
                // Still pending/processing. Give it the grace window; past
                // that, declare it stuck and settle as a failure.
                if res.created_at > stuck_cutoff {
                    report.skipped += 1;
                    continue;
                }

                crate::finalize::finalize_failure(
                    pool,
                    op.asset_kind,
                    op_uuid,
                    STUCK_ERROR,
                    correlation_id,
                )
                .await
                .context("janitor stuck finalize failed")?;
                warn!(operation_id = %op_uuid, "janitor failed stuck operation");
                report.stuck_failed += 1;
            }
            None => {
                // Operation row is gone (asset cascade); the reservation
                // must not outlive it.
                if let ReleaseOutcome::Released { .. } =
                    vf_db::release(pool, &res.operation_id, correlation_id)
                        .await
                        .map_err(anyhow::Error::new)
                        .context("janitor orphan release failed")?
                {
                    warn!(
                        operation_ref = res.operation_id,
                        "janitor released reservation for missing operation"
                    );
                    report.released += 1;
                } else {
                    report.skipped += 1;
                }
            }
        }
    }

    Ok(report)
}

//! Restart recovery.
//!
//! Submission enqueues only after commit, so a crash (or a Redis outage)
//! can strand committed operations with no job. At worker startup this
//! scan re-enqueues every non-terminal operation whose source file still
//! exists; operations whose source is gone are finalized as failed, which
//! releases their credits.

use std::path::Path;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use vf_config::AppConfig;
use vf_queue::JobQueue;
use vf_schemas::events::{JobPayload, TraceContext, TraceEnvelope};
use vf_schemas::{AssetKind, OperationParameters, Priority};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub requeued: usize,
    pub failed_missing_source: usize,
    pub skipped: usize,
}

fn source_is_usable(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

pub async fn recover_unqueued(
    pool: &PgPool,
    queue: &JobQueue,
    cfg: &AppConfig,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for kind in [AssetKind::Video, AssetKind::Image] {
        let ops = vf_db::list_recoverable_operations(pool, kind).await?;
        report.scanned += ops.len();

        for op in ops {
            let Some(asset) = vf_db::fetch_asset(pool, kind, op.asset_id).await? else {
                // Asset cascade in flight; the janitor settles the ledger side.
                report.skipped += 1;
                continue;
            };

            let parameters: OperationParameters =
                match serde_json::from_value(op.parameters.clone()) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(
                            operation_id = %op.operation_id,
                            error = %e,
                            "recovery: undecodable parameters; failing operation"
                        );
                        crate::finalize::finalize_failure(
                            pool,
                            kind,
                            op.operation_id,
                            "unrecoverable parameters",
                            Uuid::new_v4(),
                        )
                        .await?;
                        report.failed_missing_source += 1;
                        continue;
                    }
                };

            let source_path = asset.source_path(&cfg.storage_root);
            if !source_is_usable(&source_path) {
                warn!(
                    operation_id = %op.operation_id,
                    source = %source_path.display(),
                    "recovery: source file missing; failing operation"
                );
                crate::finalize::finalize_failure(
                    pool,
                    kind,
                    op.operation_id,
                    "source file missing at recovery",
                    Uuid::new_v4(),
                )
                .await?;
                report.failed_missing_source += 1;
                continue;
            }

            let envelope = TraceEnvelope {
                trace: TraceContext::new(Uuid::new_v4()),
                payload: JobPayload {
                    operation_id: op.operation_id,
                    user_id: asset.user_id,
                    asset_kind: kind,
                    asset_id: op.asset_id,
                    op_type: op.op_type,
                    parameters,
                    source_path: source_path.to_string_lossy().into_owned(),
                },
            };

            queue
                .enqueue(envelope, Priority::Normal)
                .await
                .context("recovery enqueue failed")?;
            report.requeued += 1;
        }
    }

    info!(
        scanned = report.scanned,
        requeued = report.requeued,
        failed = report.failed_missing_source,
        "startup recovery pass complete"
    );
    Ok(report)
}

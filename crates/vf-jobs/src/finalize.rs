//! Finalizer: the single transaction that ends an operation.
//!
//! Success: `completed` + `debit_capture` + `job.completed` outbox event.
//! Terminal failure: `failed` + `refund` + `job.failed` outbox event.
//!
//! Every leg is idempotent (status guard, ledger uniqueness, outbox key),
//! so a worker retrying a crashed finalization converges instead of
//! double-settling. Non-terminal failures must never come here; they
//! leave the reservation for the retry to capture.

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use vf_schemas::events::{op_event_key, EVENT_JOB_COMPLETED, EVENT_JOB_FAILED};
use vf_schemas::{ledger_op_id, AssetKind, OperationStatus};

fn job_payload(
    operation_id: Uuid,
    kind: AssetKind,
    asset_id: Uuid,
    op_type: &str,
    extra: serde_json::Value,
) -> serde_json::Value {
    let mut payload = json!({
        "operationId": operation_id,
        "type": op_type,
    });
    if let serde_json::Value::Object(map) = &mut payload {
        map.insert(kind.payload_id_field().to_string(), json!(asset_id));
        if let serde_json::Value::Object(extra) = extra {
            for (k, v) in extra {
                map.insert(k, v);
            }
        }
    }
    payload
}

/// Operation succeeded: commit result path, capture credits, emit
/// `job.completed`.
pub async fn finalize_success(
    pool: &PgPool,
    kind: AssetKind,
    operation_id: Uuid,
    result_path: &str,
    correlation_id: Uuid,
) -> Result<()> {
    let op = vf_db::fetch_operation(pool, kind, operation_id)
        .await?
        .with_context(|| format!("finalize_success: operation {operation_id} not found"))?;

    // A raced worker may have settled the other way already; in that case
    // this call must change nothing (the ledger trigger would reject a
    // capture-after-refund anyway).
    if op.status == OperationStatus::Failed {
        info!(operation_id = %operation_id, "finalize_success skipped: already failed");
        return Ok(());
    }

    let mut tx = pool.begin().await.context("finalize_success begin failed")?;

    vf_db::update_status_tx(
        &mut tx,
        kind,
        operation_id,
        OperationStatus::Completed,
        Some(result_path),
        None,
    )
    .await?;

    vf_db::capture_tx(&mut tx, &ledger_op_id(operation_id), correlation_id)
        .await
        .map_err(anyhow::Error::new)
        .context("finalize_success capture failed")?;

    vf_db::outbox_insert_tx(
        &mut tx,
        &vf_db::NewOutboxEvent {
            event_id: Uuid::new_v4(),
            event_type: EVENT_JOB_COMPLETED.to_string(),
            aggregate_type: kind.as_str().to_string(),
            aggregate_id: op.asset_id.to_string(),
            idempotency_key: op_event_key(operation_id, "completed"),
            payload: job_payload(
                operation_id,
                kind,
                op.asset_id,
                op.op_type.as_str(),
                json!({ "result": result_path }),
            ),
            correlation_id: Some(correlation_id),
        },
    )
    .await?;

    tx.commit().await.context("finalize_success commit failed")?;

    info!(operation_id = %operation_id, result_path, "operation finalized: completed");
    Ok(())
}

/// Terminal failure: mark `failed`, refund the reservation, emit
/// `job.failed`. Declared by the queue when attempts are exhausted or the
/// error is terminal outright.
pub async fn finalize_failure(
    pool: &PgPool,
    kind: AssetKind,
    operation_id: Uuid,
    error_message: &str,
    correlation_id: Uuid,
) -> Result<()> {
    let op = vf_db::fetch_operation(pool, kind, operation_id)
        .await?
        .with_context(|| format!("finalize_failure: operation {operation_id} not found"))?;

    if op.status == OperationStatus::Completed {
        info!(operation_id = %operation_id, "finalize_failure skipped: already completed");
        return Ok(());
    }

    let mut tx = pool.begin().await.context("finalize_failure begin failed")?;

    vf_db::update_status_tx(
        &mut tx,
        kind,
        operation_id,
        OperationStatus::Failed,
        None,
        Some(error_message),
    )
    .await?;

    vf_db::release_tx(&mut tx, &ledger_op_id(operation_id), correlation_id)
        .await
        .map_err(anyhow::Error::new)
        .context("finalize_failure release failed")?;

    vf_db::outbox_insert_tx(
        &mut tx,
        &vf_db::NewOutboxEvent {
            event_id: Uuid::new_v4(),
            event_type: EVENT_JOB_FAILED.to_string(),
            aggregate_type: kind.as_str().to_string(),
            aggregate_id: op.asset_id.to_string(),
            idempotency_key: op_event_key(operation_id, "failed"),
            payload: job_payload(
                operation_id,
                kind,
                op.asset_id,
                op.op_type.as_str(),
                json!({ "error": error_message }),
            ),
            correlation_id: Some(correlation_id),
        },
    )
    .await?;

    tx.commit().await.context("finalize_failure commit failed")?;

    info!(operation_id = %operation_id, error_message, "operation finalized: failed");
    Ok(())
}

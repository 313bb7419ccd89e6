//! Submission service.
//!
//! `submit` validates before opening the transaction, then atomically:
//! inserts the `pending` operation, reserves credits (which itself appends
//! the `billing.reservation.reserved` outbox event), and appends
//! `job.submitted`. Only after commit is the job enqueued, best-effort;
//! a failed enqueue is repaired by restart recovery, never by retrying the
//! transaction.

use anyhow::Context;
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use vf_config::AppConfig;
use vf_db::{LedgerError, NewOperation};
use vf_queue::JobQueue;
use vf_schemas::events::{op_event_key, JobPayload, TraceContext, TraceEnvelope, EVENT_JOB_SUBMITTED};
use vf_schemas::{ledger_op_id, OperationParameters, Priority};

// ---------------------------------------------------------------------------
// SubmitError
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SubmitError {
    /// Malformed or domain-invalid parameters. Nothing was written.
    Validation(String),
    /// Asset does not exist.
    AssetMissing(Uuid),
    /// Asset belongs to someone else. Nothing was written.
    Ownership { asset_id: Uuid, user_id: Uuid },
    /// Reservation failed (insufficient credits and friends).
    Billing(LedgerError),
    Db(anyhow::Error),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Validation(msg) => write!(f, "validation failed: {msg}"),
            SubmitError::AssetMissing(id) => write!(f, "asset {id} not found"),
            SubmitError::Ownership { asset_id, user_id } => {
                write!(f, "asset {asset_id} is not owned by user {user_id}")
            }
            SubmitError::Billing(e) => write!(f, "billing: {e}"),
            SubmitError::Db(e) => write!(f, "submission db error: {e}"),
        }
    }
}

impl std::error::Error for SubmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SubmitError::Billing(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LedgerError> for SubmitError {
    fn from(e: LedgerError) -> Self {
        SubmitError::Billing(e)
    }
}

impl From<anyhow::Error> for SubmitError {
    fn from(e: anyhow::Error) -> Self {
        SubmitError::Db(e)
    }
}

impl From<sqlx::Error> for SubmitError {
    fn from(e: sqlx::Error) -> Self {
        SubmitError::Db(anyhow::Error::new(e))
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Submission {
    pub user_id: Uuid,
    pub asset_id: Uuid,
    pub parameters: OperationParameters,
    pub priority: Priority,
    pub trace: TraceContext,
}

#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub operation_id: Uuid,
    /// Queue job id; `None` when enqueue was skipped or failed (recovery
    /// re-enqueues at worker startup).
    pub job_id: Option<String>,
    pub balance: i64,
}

/// Submit one transformation. See module docs for the atomicity contract.
pub async fn submit(
    pool: &PgPool,
    queue: Option<&JobQueue>,
    cfg: &AppConfig,
    req: Submission,
) -> Result<SubmissionOutcome, SubmitError> {
    let op_type = req.parameters.op_type();
    let kind = op_type.asset_kind();

    // Domain checks happen before any transaction is opened.
    let asset = vf_db::fetch_asset(pool, kind, req.asset_id)
        .await?
        .ok_or(SubmitError::AssetMissing(req.asset_id))?;
    if asset.user_id != req.user_id {
        return Err(SubmitError::Ownership {
            asset_id: req.asset_id,
            user_id: req.user_id,
        });
    }
    req.parameters
        .validate(&asset.format, asset.dims())
        .map_err(|e| SubmitError::Validation(e.to_string()))?;

    let operation_id = Uuid::new_v4();
    let parameters =
        serde_json::to_value(&req.parameters).context("parameter serialization failed")?;
    let cost = cfg.cost_of(op_type);
    let source_path = asset.source_path(&cfg.storage_root);

    // One transaction: operation + reservation (+ its outbox event) +
    // job.submitted outbox event.
    let mut tx = pool.begin().await.map_err(SubmitError::from)?;

    vf_db::add_operation_tx(
        &mut tx,
        &NewOperation {
            operation_id,
            asset_kind: kind,
            asset_id: req.asset_id,
            op_type,
            parameters: parameters.clone(),
        },
    )
    .await?;

    let balance = vf_db::reserve_tx(
        &mut tx,
        req.user_id,
        cost,
        &ledger_op_id(operation_id),
        req.trace.correlation_id,
    )
    .await?;

    let mut payload = json!({
        "operationId": operation_id,
        "type": op_type.as_str(),
        "userId": req.user_id,
        "cost": cost,
    });
    if let serde_json::Value::Object(map) = &mut payload {
        map.insert(kind.payload_id_field().to_string(), json!(req.asset_id));
    }

    vf_db::outbox_insert_tx(
        &mut tx,
        &vf_db::NewOutboxEvent {
            event_id: Uuid::new_v4(),
            event_type: EVENT_JOB_SUBMITTED.to_string(),
            aggregate_type: kind.as_str().to_string(),
            aggregate_id: req.asset_id.to_string(),
            idempotency_key: op_event_key(operation_id, "submitted"),
            payload,
            correlation_id: Some(req.trace.correlation_id),
        },
    )
    .await?;

    tx.commit().await.map_err(SubmitError::from)?;

    info!(
        operation_id = %operation_id,
        op_type = op_type.as_str(),
        cost,
        balance,
        "operation submitted"
    );

    // Post-commit enqueue. A failure here is recoverable drift, not an
    // error the caller should see.
    let mut job_id = None;
    if let Some(queue) = queue {
        let envelope = TraceEnvelope {
            trace: req.trace.clone(),
            payload: JobPayload {
                operation_id,
                user_id: req.user_id,
                asset_kind: kind,
                asset_id: req.asset_id,
                op_type,
                parameters: req.parameters.clone(),
                source_path: source_path.to_string_lossy().into_owned(),
            },
        };
        match queue.enqueue(envelope, req.priority).await {
            Ok(id) => job_id = Some(id),
            Err(e) => {
                warn!(
                    operation_id = %operation_id,
                    error = %e,
                    "enqueue failed after commit; startup recovery will re-enqueue"
                );
            }
        }
    }

    Ok(SubmissionOutcome {
        operation_id,
        job_id,
        balance,
    })
}

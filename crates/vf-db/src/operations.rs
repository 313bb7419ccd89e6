//! Operation store.
//!
//! One row per requested transformation, forward-only status machine
//! `pending → processing → {completed, failed}`. The transition guard is
//! in the SQL predicate, so a raced or replayed update simply matches
//! zero rows and the caller learns nothing changed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use vf_schemas::{params_fingerprint, AssetKind, OperationStatus, OperationType};

#[derive(Debug, Clone)]
pub struct OperationRow {
    pub operation_id: Uuid,
    pub asset_id: Uuid,
    pub asset_kind: AssetKind,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub parameters: Value,
    pub params_fingerprint: String,
    pub result_path: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewOperation {
    pub operation_id: Uuid,
    pub asset_kind: AssetKind,
    pub asset_id: Uuid,
    pub op_type: OperationType,
    pub parameters: Value,
}

fn table(kind: AssetKind) -> &'static str {
    match kind {
        AssetKind::Video => "video_operations",
        AssetKind::Image => "image_operations",
    }
}

fn asset_col(kind: AssetKind) -> &'static str {
    match kind {
        AssetKind::Video => "video_id",
        AssetKind::Image => "image_id",
    }
}

fn row_from(kind: AssetKind, row: &sqlx::postgres::PgRow) -> Result<OperationRow> {
    Ok(OperationRow {
        operation_id: row.try_get("operation_id")?,
        asset_id: row.try_get("asset_id")?,
        asset_kind: kind,
        op_type: OperationType::parse(&row.try_get::<String, _>("op_type")?)
            .map_err(|e| anyhow::anyhow!(e))?,
        status: OperationStatus::parse(&row.try_get::<String, _>("status")?)
            .map_err(|e| anyhow::anyhow!(e))?,
        parameters: row.try_get("parameters")?,
        params_fingerprint: row.try_get("params_fingerprint")?,
        result_path: row.try_get("result_path")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

const SELECT_COLS: &str = "operation_id, {asset} as asset_id, op_type, status, parameters, \
                           params_fingerprint, result_path, error_message, created_at, \
                           started_at, finished_at";

fn select_cols(kind: AssetKind) -> String {
    SELECT_COLS.replace("{asset}", asset_col(kind))
}

/// Insert a `pending` operation inside the caller's transaction.
pub async fn add_operation_tx(conn: &mut PgConnection, op: &NewOperation) -> Result<()> {
    let sql = format!(
        r#"
        insert into {table} ({asset}, operation_id, op_type, parameters, params_fingerprint)
        values ($1, $2, $3, $4, $5)
        "#,
        table = table(op.asset_kind),
        asset = asset_col(op.asset_kind),
    );

    sqlx::query(&sql)
        .bind(op.asset_id)
        .bind(op.operation_id)
        .bind(op.op_type.as_str())
        .bind(&op.parameters)
        .bind(params_fingerprint(&op.parameters))
        .execute(conn)
        .await
        .context("add_operation failed")?;

    Ok(())
}

pub async fn fetch_operation(
    pool: &PgPool,
    kind: AssetKind,
    operation_id: Uuid,
) -> Result<Option<OperationRow>> {
    let sql = format!(
        "select {cols} from {table} where operation_id = $1",
        cols = select_cols(kind),
        table = table(kind),
    );

    let row = sqlx::query(&sql)
        .bind(operation_id)
        .fetch_optional(pool)
        .await
        .context("fetch_operation failed")?;

    match row {
        Some(row) => Ok(Some(row_from(kind, &row)?)),
        None => Ok(None),
    }
}

/// Look an operation up without knowing its asset family. Used by the
/// janitor, which starts from a ledger `op-<uuid>` reference.
pub async fn fetch_operation_any(
    pool: &PgPool,
    operation_id: Uuid,
) -> Result<Option<OperationRow>> {
    for kind in [AssetKind::Video, AssetKind::Image] {
        if let Some(op) = fetch_operation(pool, kind, operation_id).await? {
            return Ok(Some(op));
        }
    }
    Ok(None)
}

/// Submission-time idempotency hook: newest operation for the same
/// `(asset, type, parameters)` tuple, if any.
pub async fn find_operation(
    pool: &PgPool,
    kind: AssetKind,
    asset_id: Uuid,
    op_type: OperationType,
    parameters: &Value,
) -> Result<Option<OperationRow>> {
    let sql = format!(
        r#"
        select {cols} from {table}
        where {asset} = $1 and op_type = $2 and params_fingerprint = $3
        order by created_at desc
        limit 1
        "#,
        cols = select_cols(kind),
        table = table(kind),
        asset = asset_col(kind),
    );

    let row = sqlx::query(&sql)
        .bind(asset_id)
        .bind(op_type.as_str())
        .bind(params_fingerprint(parameters))
        .fetch_optional(pool)
        .await
        .context("find_operation failed")?;

    match row {
        Some(row) => Ok(Some(row_from(kind, &row)?)),
        None => Ok(None),
    }
}

/// Transition an operation, enforcing the forward-only machine in SQL.
///
/// Returns `true` when the transition applied; `false` when the row was
/// missing or not in a legal predecessor state (idempotent replays land
/// here). `started_at` / `finished_at` stamp on entry to `processing` /
/// a terminal state.
pub async fn update_status_tx(
    conn: &mut PgConnection,
    kind: AssetKind,
    operation_id: Uuid,
    new_status: OperationStatus,
    result_path: Option<&str>,
    error_message: Option<&str>,
) -> Result<bool> {
    let predecessors: Vec<String> = match new_status {
        OperationStatus::Pending => return Ok(false),
        OperationStatus::Processing => vec!["pending".into()],
        OperationStatus::Completed => vec!["processing".into()],
        OperationStatus::Failed => vec!["pending".into(), "processing".into()],
    };

    let stamp = match new_status {
        OperationStatus::Processing => "started_at = now()",
        OperationStatus::Completed | OperationStatus::Failed => "finished_at = now()",
        OperationStatus::Pending => unreachable!(),
    };

    let sql = format!(
        r#"
        update {table}
           set status = $1,
               result_path = coalesce($2, result_path),
               error_message = coalesce($3, error_message),
               {stamp}
         where operation_id = $4
           and status = any($5)
        returning operation_id
        "#,
        table = table(kind),
    );

    let row: Option<(Uuid,)> = sqlx::query_as(&sql)
        .bind(new_status.as_str())
        .bind(result_path)
        .bind(error_message)
        .bind(operation_id)
        .bind(predecessors)
        .fetch_optional(conn)
        .await
        .context("update_status failed")?;

    Ok(row.is_some())
}

/// Pool-level wrapper for callers outside a composed transaction
/// (e.g. the worker's `pending → processing` step).
pub async fn update_status(
    pool: &PgPool,
    kind: AssetKind,
    operation_id: Uuid,
    new_status: OperationStatus,
    result_path: Option<&str>,
    error_message: Option<&str>,
) -> Result<bool> {
    let mut conn = pool.acquire().await.context("update_status acquire failed")?;
    update_status_tx(
        &mut conn,
        kind,
        operation_id,
        new_status,
        result_path,
        error_message,
    )
    .await
}

/// Non-terminal operations, oldest first: the restart-recovery scan.
pub async fn list_recoverable_operations(
    pool: &PgPool,
    kind: AssetKind,
) -> Result<Vec<OperationRow>> {
    let sql = format!(
        r#"
        select {cols} from {table}
        where status in ('pending', 'processing')
        order by created_at asc
        "#,
        cols = select_cols(kind),
        table = table(kind),
    );

    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .context("list_recoverable_operations failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(row_from(kind, &row)?);
    }
    Ok(out)
}

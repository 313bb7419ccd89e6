//! Transactional outbox store.
//!
//! Producer side: `outbox_insert_tx` inside business transactions, with
//! duplicate idempotency keys silently ignored so retries are free.
//!
//! Consumer side: `outbox_claim_batch` transitions retryable rows to
//! `processing` under `FOR UPDATE SKIP LOCKED`, so concurrent dispatchers
//! never fight over a row and a crashed dispatcher's lease simply expires.
//! The claim function is feature-gated (`runtime-claim`); only vf-runtime
//! enables it, making the dispatcher the sole claim path at compile time.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

/// Base backoff: retry n is scheduled 2.5·2^n seconds out, i.e. 5 s,
/// 10 s, 20 s, … for the first, second, third retry.
const BACKOFF_BASE_SECS: f64 = 2.5;

#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub idempotency_key: String,
    pub payload: Value,
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct OutboxEventRow {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub idempotency_key: String,
    pub payload: Value,
    pub status: String,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

fn row_from(row: &sqlx::postgres::PgRow) -> Result<OutboxEventRow> {
    Ok(OutboxEventRow {
        event_id: row.try_get("event_id")?,
        event_type: row.try_get("event_type")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        payload: row.try_get("payload")?,
        status: row.try_get("status")?,
        attempts: row.try_get("attempts")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        locked_at: row.try_get("locked_at")?,
        locked_by: row.try_get("locked_by")?,
        correlation_id: row.try_get("correlation_id")?,
        created_at: row.try_get("created_at")?,
    })
}

const SELECT_COLS: &str = "event_id, event_type, aggregate_type, aggregate_id, \
                           idempotency_key, payload, status, attempts, next_attempt_at, \
                           locked_at, locked_by, correlation_id, created_at";

/// Append an event inside the caller's transaction.
///
/// Returns `true` if a row was inserted, `false` when the idempotency key
/// already exists (safe retry by business code).
pub async fn outbox_insert_tx(conn: &mut PgConnection, ev: &NewOutboxEvent) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        insert into outbox_events
            (event_id, event_type, aggregate_type, aggregate_id,
             idempotency_key, payload, correlation_id)
        values ($1, $2, $3, $4, $5, $6, $7)
        on conflict (idempotency_key) do nothing
        returning event_id
        "#,
    )
    .bind(ev.event_id)
    .bind(&ev.event_type)
    .bind(&ev.aggregate_type)
    .bind(&ev.aggregate_id)
    .bind(&ev.idempotency_key)
    .bind(&ev.payload)
    .bind(ev.correlation_id)
    .fetch_optional(conn)
    .await
    .context("outbox_insert failed")?;

    Ok(row.is_some())
}

/// A row handed to the dispatcher by [`outbox_claim_batch`].
#[cfg(any(feature = "runtime-claim", feature = "testkit"))]
pub type ClaimedOutboxEvent = OutboxEventRow;

/// Atomically claim up to `batch_size` dispatchable rows.
///
/// Dispatchable means: retryable (`pending`/`failed`) and due, or
/// `processing` with an expired lease (crashed dispatcher). Claimed rows
/// move to `processing` stamped with `locked_at` / `locked_by`. Claim
/// order is FIFO by `created_at`.
#[cfg(any(feature = "runtime-claim", feature = "testkit"))]
pub async fn outbox_claim_batch(
    pool: &PgPool,
    batch_size: i64,
    dispatcher_id: &str,
    lease_seconds: i64,
) -> Result<Vec<ClaimedOutboxEvent>> {
    let sql = format!(
        r#"
        with to_claim as (
            select event_id
            from outbox_events
            where (status in ('pending', 'failed') and next_attempt_at <= now())
               or (status = 'processing'
                   and locked_at < now() - make_interval(secs => $3))
            order by created_at asc
            limit $1
            for update skip locked
        )
        update outbox_events
           set status     = 'processing',
               locked_at  = now(),
               locked_by  = $2,
               updated_at = now()
         where event_id in (select event_id from to_claim)
        returning {SELECT_COLS}
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(batch_size)
        .bind(dispatcher_id)
        .bind(lease_seconds as f64)
        .fetch_all(pool)
        .await
        .context("outbox_claim_batch failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(row_from(&row)?);
    }
    // The single UPDATE returns rows in table order; re-sort to keep the
    // FIFO contract for the caller.
    out.sort_by_key(|e| e.created_at);
    Ok(out)
}

/// Publication succeeded: `processing → published`, lease cleared.
pub async fn outbox_mark_published(pool: &PgPool, event_id: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update outbox_events
           set status = 'published',
               locked_at = null,
               locked_by = null,
               updated_at = now()
         where event_id = $1
           and status = 'processing'
        returning event_id
        "#,
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await
    .context("outbox_mark_published failed")?;

    Ok(row.is_some())
}

/// Publication failed: bump attempts and park with exponential backoff,
/// or move to `dead` once `max_attempts` is reached. One statement, so a
/// crash can never leave the row half-transitioned.
///
/// Returns the new attempt count.
pub async fn outbox_mark_failed(pool: &PgPool, event_id: Uuid, max_attempts: i32) -> Result<i32> {
    let row: Option<(i32,)> = sqlx::query_as(
        r#"
        update outbox_events
           set attempts = attempts + 1,
               status = case when attempts + 1 >= $2 then 'dead' else 'failed' end,
               next_attempt_at = now() + make_interval(secs => $3 * power(2, attempts + 1)),
               locked_at = null,
               locked_by = null,
               updated_at = now()
         where event_id = $1
        returning attempts
        "#,
    )
    .bind(event_id)
    .bind(max_attempts)
    .bind(BACKOFF_BASE_SECS)
    .fetch_optional(pool)
    .await
    .context("outbox_mark_failed failed")?;

    Ok(row.map(|(n,)| n).unwrap_or(0))
}

/// Retention sweep: delete `published` rows older than `older_than_days`.
/// Returns the number of rows removed.
pub async fn outbox_prune_published(pool: &PgPool, older_than_days: i64) -> Result<u64> {
    let res = sqlx::query(
        r#"
        delete from outbox_events
        where status = 'published'
          and created_at < now() - make_interval(days => $1)
        "#,
    )
    .bind(older_than_days as i32)
    .execute(pool)
    .await
    .context("outbox_prune_published failed")?;

    Ok(res.rows_affected())
}

/// Rows still awaiting publication (`pending`/`processing`/`failed`).
pub async fn outbox_pending_count(pool: &PgPool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from outbox_events
        where status in ('pending', 'processing', 'failed')
        "#,
    )
    .fetch_one(pool)
    .await
    .context("outbox_pending_count failed")?;
    Ok(n)
}

/// Fetch one event by idempotency key (test and recovery tooling).
pub async fn outbox_fetch_by_key(
    pool: &PgPool,
    idempotency_key: &str,
) -> Result<Option<OutboxEventRow>> {
    let sql = format!("select {SELECT_COLS} from outbox_events where idempotency_key = $1");

    let row = sqlx::query(&sql)
        .bind(idempotency_key)
        .fetch_optional(pool)
        .await
        .context("outbox_fetch_by_key failed")?;

    match row {
        Some(row) => Ok(Some(row_from(&row)?)),
        None => Ok(None),
    }
}

//! Append-only credit ledger.
//!
//! Every mutator locks the user row (`FOR UPDATE`) before touching the
//! ledger or the cached balance, so concurrent reservations for one user
//! serialize. The trigger + partial-unique-index layer in the migration is
//! the backstop that holds even if a bug slips past these guards.
//!
//! `reserve`/`capture`/`release` append the matching
//! `billing.reservation.*` outbox event inside the same transaction, which
//! is what makes the ledger and the outside world agree.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use vf_schemas::events::{
    EVENT_RESERVATION_CAPTURED, EVENT_RESERVATION_RELEASED, EVENT_RESERVATION_RESERVED,
};
use vf_schemas::LedgerEntryType;

use crate::outbox::{outbox_insert_tx, NewOutboxEvent};

// ---------------------------------------------------------------------------
// LedgerError
// ---------------------------------------------------------------------------

/// Failures callers must distinguish. Everything else (connection loss,
/// trigger rejections racing past the app guards) surfaces as `Db`.
#[derive(Debug)]
pub enum LedgerError {
    /// Balance would go negative. No side effects.
    InsufficientCredits { balance: i64, requested: i64 },
    /// `capture` without a prior reservation.
    NoReservation { operation_id: String },
    /// `capture` after the operation was already refunded (or vice-versa
    /// paths caught before the trigger fires).
    AlreadySettled { operation_id: String },
    /// `request_id` reuse across different users.
    RequestIdCollision { request_id: String },
    UnknownUser(Uuid),
    Db(sqlx::Error),
    /// Non-ledger failure inside a ledger transaction (outbox append).
    Other(anyhow::Error),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::InsufficientCredits { balance, requested } => write!(
                f,
                "insufficient credits: balance={balance} requested={requested}"
            ),
            LedgerError::NoReservation { operation_id } => {
                write!(f, "no reservation exists for operation {operation_id}")
            }
            LedgerError::AlreadySettled { operation_id } => {
                write!(f, "operation {operation_id} is already settled")
            }
            LedgerError::RequestIdCollision { request_id } => {
                write!(f, "request id {request_id} is bound to a different user")
            }
            LedgerError::UnknownUser(id) => write!(f, "unknown user {id}"),
            LedgerError::Db(e) => write!(f, "ledger db error: {e}"),
            LedgerError::Other(e) => write!(f, "ledger error: {e}"),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LedgerError::Db(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Db(e)
    }
}

impl From<anyhow::Error> for LedgerError {
    fn from(e: anyhow::Error) -> Self {
        LedgerError::Other(e)
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LedgerEntryRow {
    pub txn_id: i64,
    pub user_id: Uuid,
    pub amount: i64,
    pub txn_type: LedgerEntryType,
    pub description: String,
    pub operation_id: Option<String>,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn entry_from(row: &sqlx::postgres::PgRow) -> anyhow::Result<LedgerEntryRow> {
    Ok(LedgerEntryRow {
        txn_id: row.try_get("txn_id")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        txn_type: LedgerEntryType::parse(&row.try_get::<String, _>("txn_type")?)
            .map_err(|e| anyhow::anyhow!(e))?,
        description: row.try_get("description")?,
        operation_id: row.try_get("operation_id")?,
        request_id: row.try_get("request_id")?,
        created_at: row.try_get("created_at")?,
    })
}

/// A reservation with no capture/refund, old enough for the janitor.
#[derive(Debug, Clone)]
pub struct DanglingReservation {
    pub operation_id: String,
    pub user_id: Uuid,
    /// Reserved amount (negative, as stored).
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Refund written; balance restored to this value.
    Released { new_balance: i64 },
    /// Capture/refund already present, or no reservation at all.
    Noop,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Lock the user row and return the cached balance. This is the
/// serialization point for every ledger mutation.
async fn lock_user_balance(conn: &mut PgConnection, user_id: Uuid) -> Result<i64, LedgerError> {
    let row: Option<(i64,)> =
        sqlx::query_as("select credit_balance from users where user_id = $1 for update")
            .bind(user_id)
            .fetch_optional(conn)
            .await?;
    row.map(|(b,)| b).ok_or(LedgerError::UnknownUser(user_id))
}

async fn set_balance(
    conn: &mut PgConnection,
    user_id: Uuid,
    new_balance: i64,
) -> Result<(), LedgerError> {
    sqlx::query("update users set credit_balance = $1 where user_id = $2")
        .bind(new_balance)
        .bind(user_id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn insert_entry(
    conn: &mut PgConnection,
    user_id: Uuid,
    amount: i64,
    txn_type: LedgerEntryType,
    description: &str,
    operation_id: Option<&str>,
    request_id: Option<&str>,
) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        insert into credit_transactions
            (user_id, amount, txn_type, description, operation_id, request_id)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .bind(txn_type.as_str())
    .bind(description)
    .bind(operation_id)
    .bind(request_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Settlement entries (`reservation` / `debit_capture` / `refund`) for an
/// operation, if any.
async fn settlement_state(
    conn: &mut PgConnection,
    operation_id: &str,
) -> Result<SettlementState, LedgerError> {
    let rows = sqlx::query(
        r#"
        select txn_type, user_id, amount
        from credit_transactions
        where operation_id = $1
          and txn_type in ('reservation', 'debit_capture', 'refund')
        "#,
    )
    .bind(operation_id)
    .fetch_all(conn)
    .await?;

    let mut state = SettlementState::default();
    for row in rows {
        let t: String = row.try_get("txn_type")?;
        match t.as_str() {
            "reservation" => {
                state.reservation = Some((row.try_get("user_id")?, row.try_get("amount")?))
            }
            "debit_capture" => state.captured = true,
            "refund" => state.refunded = true,
            _ => {}
        }
    }
    Ok(state)
}

#[derive(Debug, Default)]
struct SettlementState {
    /// `(user_id, amount)` of the reservation entry (amount is negative).
    reservation: Option<(Uuid, i64)>,
    captured: bool,
    refunded: bool,
}

fn billing_event(
    event_type: &'static str,
    key_suffix: &'static str,
    user_id: Uuid,
    operation_id: &str,
    amount: i64,
    balance: i64,
    correlation_id: Uuid,
) -> NewOutboxEvent {
    NewOutboxEvent {
        event_id: Uuid::new_v4(),
        event_type: event_type.to_string(),
        aggregate_type: "user".to_string(),
        aggregate_id: user_id.to_string(),
        idempotency_key: format!("{operation_id}:{key_suffix}"),
        payload: json!({
            "userId": user_id,
            "operationId": operation_id,
            "amount": amount,
            "balance": balance,
        }),
        correlation_id: Some(correlation_id),
    }
}

// ---------------------------------------------------------------------------
// add
// ---------------------------------------------------------------------------

/// Append an `addition` entry and bump the cached balance.
///
/// Idempotency: a `request_id` already recorded for the same user makes
/// this a no-op returning the current balance; for a different user it is
/// [`LedgerError::RequestIdCollision`].
pub async fn add_credits_tx(
    conn: &mut PgConnection,
    user_id: Uuid,
    amount: i64,
    description: &str,
    request_id: Option<&str>,
) -> Result<i64, LedgerError> {
    let balance = lock_user_balance(conn, user_id).await?;

    // `on conflict do nothing` on the request-id index makes concurrent
    // replays race-safe: the loser sees no inserted row and re-reads who
    // owns the id instead of aborting the transaction.
    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        insert into credit_transactions
            (user_id, amount, txn_type, description, request_id)
        values ($1, $2, 'addition', $3, $4)
        on conflict (request_id) where request_id is not null do nothing
        returning txn_id
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .bind(description)
    .bind(request_id)
    .fetch_optional(&mut *conn)
    .await?;

    if inserted.is_none() {
        let rid = request_id.unwrap_or_default();
        let existing: Option<(Uuid,)> =
            sqlx::query_as("select user_id from credit_transactions where request_id = $1")
                .bind(rid)
                .fetch_optional(&mut *conn)
                .await?;
        return match existing {
            Some((owner,)) if owner == user_id => Ok(balance),
            _ => Err(LedgerError::RequestIdCollision {
                request_id: rid.to_string(),
            }),
        };
    }

    let new_balance = balance + amount;
    set_balance(conn, user_id, new_balance).await?;
    Ok(new_balance)
}

pub async fn add_credits(
    pool: &PgPool,
    user_id: Uuid,
    amount: i64,
    description: &str,
    request_id: Option<&str>,
) -> Result<i64, LedgerError> {
    let mut tx = pool.begin().await?;
    let balance = add_credits_tx(&mut tx, user_id, amount, description, request_id).await?;
    tx.commit().await?;
    Ok(balance)
}

// ---------------------------------------------------------------------------
// reserve
// ---------------------------------------------------------------------------

/// Reserve `amount` credits against `operation_id`.
///
/// Idempotent: an existing reservation or capture for the operation
/// returns the current balance without writing. Insufficient balance
/// fails without side effects. On success the balance is debited and the
/// `billing.reservation.reserved` event is appended in the same tx.
pub async fn reserve_tx(
    conn: &mut PgConnection,
    user_id: Uuid,
    amount: i64,
    operation_id: &str,
    correlation_id: Uuid,
) -> Result<i64, LedgerError> {
    debug_assert!(amount > 0, "reserve amount must be positive");

    let balance = lock_user_balance(conn, user_id).await?;

    let state = settlement_state(conn, operation_id).await?;
    if state.reservation.is_some() || state.captured {
        return Ok(balance);
    }

    if balance < amount {
        return Err(LedgerError::InsufficientCredits {
            balance,
            requested: amount,
        });
    }

    // `on conflict do nothing` against the partial unique index is the
    // backstop for writers that never took the user lock (manual SQL,
    // historical bugs): a duplicate reservation degrades to the
    // idempotent no-op instead of aborting the enclosing transaction.
    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        insert into credit_transactions
            (user_id, amount, txn_type, description, operation_id)
        values ($1, $2, 'reservation', 'credit reservation', $3)
        on conflict (operation_id) where txn_type = 'reservation' do nothing
        returning txn_id
        "#,
    )
    .bind(user_id)
    .bind(-amount)
    .bind(operation_id)
    .fetch_optional(&mut *conn)
    .await?;
    if inserted.is_none() {
        return Ok(balance);
    }

    let new_balance = balance - amount;
    set_balance(conn, user_id, new_balance).await?;

    outbox_insert_tx(
        conn,
        &billing_event(
            EVENT_RESERVATION_RESERVED,
            "reserved",
            user_id,
            operation_id,
            -amount,
            new_balance,
            correlation_id,
        ),
    )
    .await?;

    Ok(new_balance)
}

pub async fn reserve(
    pool: &PgPool,
    user_id: Uuid,
    amount: i64,
    operation_id: &str,
    correlation_id: Uuid,
) -> Result<i64, LedgerError> {
    let mut tx = pool.begin().await?;
    let balance = reserve_tx(&mut tx, user_id, amount, operation_id, correlation_id).await?;
    tx.commit().await?;
    Ok(balance)
}

// ---------------------------------------------------------------------------
// capture
// ---------------------------------------------------------------------------

/// Record that the reservation for `operation_id` was consumed.
///
/// Zero-amount marker entry; the balance is unchanged. Idempotent on an
/// existing capture. Fails with [`LedgerError::NoReservation`] when no
/// reservation exists and [`LedgerError::AlreadySettled`] when the
/// operation was refunded instead.
pub async fn capture_tx(
    conn: &mut PgConnection,
    operation_id: &str,
    correlation_id: Uuid,
) -> Result<(), LedgerError> {
    let state = settlement_state(conn, operation_id).await?;
    let Some((user_id, _)) = state.reservation else {
        return Err(LedgerError::NoReservation {
            operation_id: operation_id.to_string(),
        });
    };
    if state.captured {
        return Ok(());
    }
    if state.refunded {
        return Err(LedgerError::AlreadySettled {
            operation_id: operation_id.to_string(),
        });
    }

    let balance = lock_user_balance(conn, user_id).await?;

    // Re-read under the lock: a racing finalizer may have settled between
    // the unlocked peek and here.
    let state = settlement_state(conn, operation_id).await?;
    if state.captured {
        return Ok(());
    }
    if state.refunded {
        return Err(LedgerError::AlreadySettled {
            operation_id: operation_id.to_string(),
        });
    }

    insert_entry(
        conn,
        user_id,
        0,
        LedgerEntryType::DebitCapture,
        "reservation captured",
        Some(operation_id),
        None,
    )
    .await?;

    outbox_insert_tx(
        conn,
        &billing_event(
            EVENT_RESERVATION_CAPTURED,
            "captured",
            user_id,
            operation_id,
            0,
            balance,
            correlation_id,
        ),
    )
    .await?;

    Ok(())
}

pub async fn capture(
    pool: &PgPool,
    operation_id: &str,
    correlation_id: Uuid,
) -> Result<(), LedgerError> {
    let mut tx = pool.begin().await?;
    capture_tx(&mut tx, operation_id, correlation_id).await?;
    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// release
// ---------------------------------------------------------------------------

/// Undo the reservation for `operation_id` with a `refund` entry.
///
/// No-op when the operation is already settled or never reserved; a
/// janitor pass and a finalizer retry can both call this safely.
pub async fn release_tx(
    conn: &mut PgConnection,
    operation_id: &str,
    correlation_id: Uuid,
) -> Result<ReleaseOutcome, LedgerError> {
    let state = settlement_state(conn, operation_id).await?;
    let Some((user_id, reserved_amount)) = state.reservation else {
        return Ok(ReleaseOutcome::Noop);
    };
    if state.captured || state.refunded {
        return Ok(ReleaseOutcome::Noop);
    }

    let balance = lock_user_balance(conn, user_id).await?;

    let state = settlement_state(conn, operation_id).await?;
    if state.captured || state.refunded {
        return Ok(ReleaseOutcome::Noop);
    }

    let refund = -reserved_amount;
    insert_entry(
        conn,
        user_id,
        refund,
        LedgerEntryType::Refund,
        "reservation released",
        Some(operation_id),
        None,
    )
    .await?;

    let new_balance = balance + refund;
    set_balance(conn, user_id, new_balance).await?;

    outbox_insert_tx(
        conn,
        &billing_event(
            EVENT_RESERVATION_RELEASED,
            "released",
            user_id,
            operation_id,
            refund,
            new_balance,
            correlation_id,
        ),
    )
    .await?;

    Ok(ReleaseOutcome::Released { new_balance })
}

pub async fn release(
    pool: &PgPool,
    operation_id: &str,
    correlation_id: Uuid,
) -> Result<ReleaseOutcome, LedgerError> {
    let mut tx = pool.begin().await?;
    let outcome = release_tx(&mut tx, operation_id, correlation_id).await?;
    tx.commit().await?;
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

pub async fn get_balance(pool: &PgPool, user_id: Uuid) -> Result<i64, LedgerError> {
    let row: Option<(i64,)> =
        sqlx::query_as("select credit_balance from users where user_id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    row.map(|(b,)| b).ok_or(LedgerError::UnknownUser(user_id))
}

/// Paginated ledger history, newest first.
pub async fn list_transactions(
    pool: &PgPool,
    user_id: Uuid,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<LedgerEntryRow>> {
    let rows = sqlx::query(
        r#"
        select txn_id, user_id, amount, txn_type, description,
               operation_id, request_id, created_at
        from credit_transactions
        where user_id = $1
        order by txn_id desc
        limit $2 offset $3
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("list_transactions failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(entry_from(&row)?);
    }
    Ok(out)
}

/// Reservations older than `cutoff` with no capture/refund: the janitor's
/// work list, oldest first.
pub async fn find_dangling_reservations(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> anyhow::Result<Vec<DanglingReservation>> {
    let rows = sqlx::query(
        r#"
        select t.operation_id, t.user_id, t.amount, t.created_at
        from credit_transactions t
        where t.txn_type = 'reservation'
          and t.created_at < $1
          and not exists (
              select 1 from credit_transactions s
              where s.operation_id = t.operation_id
                and s.txn_type in ('debit_capture', 'refund')
          )
        order by t.created_at asc
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("find_dangling_reservations failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(DanglingReservation {
            operation_id: row
                .try_get::<Option<String>, _>("operation_id")?
                .unwrap_or_default(),
            user_id: row.try_get("user_id")?,
            amount: row.try_get("amount")?,
            created_at: row.try_get("created_at")?,
        });
    }
    Ok(out)
}

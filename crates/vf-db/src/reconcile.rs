//! Ledger-vs-balance drift audit and repair.
//!
//! `check` compares each user's cached balance to the ledger sum;
//! `repair` inserts a single compensating entry whose amount equals the
//! drift. Repair never touches existing rows; the immutability trigger
//! would reject it anyway.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use vf_schemas::LedgerEntryType;

#[derive(Debug, Clone)]
pub struct DriftRow {
    pub user_id: Uuid,
    pub email: String,
    pub balance: i64,
    pub ledger_sum: i64,
}

impl DriftRow {
    /// `balance − ledger_sum`; zero means clean.
    pub fn drift(&self) -> i64 {
        self.balance - self.ledger_sum
    }
}

/// Per-user drift, stable order. Users with an empty ledger sum to 0.
pub async fn drift_report(pool: &PgPool) -> Result<Vec<DriftRow>> {
    let rows = sqlx::query(
        r#"
        select u.user_id,
               u.email,
               u.credit_balance,
               coalesce(sum(t.amount), 0)::bigint as ledger_sum
        from users u
        left join credit_transactions t on t.user_id = u.user_id
        group by u.user_id, u.email, u.credit_balance
        order by u.created_at asc, u.user_id asc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("drift_report failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(DriftRow {
            user_id: row.try_get("user_id")?,
            email: row.try_get("email")?,
            balance: row.try_get("credit_balance")?,
            ledger_sum: row.try_get("ledger_sum")?,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct ExplainedEntry {
    pub txn_id: i64,
    pub txn_type: LedgerEntryType,
    pub amount: i64,
    pub running_balance: i64,
    pub description: String,
    pub operation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The user's ledger in insertion order with a running balance.
pub async fn explain_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<ExplainedEntry>> {
    let rows = sqlx::query(
        r#"
        select txn_id, txn_type, amount, description, operation_id, created_at
        from credit_transactions
        where user_id = $1
        order by txn_id asc
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("explain_user failed")?;

    let mut running = 0i64;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let amount: i64 = row.try_get("amount")?;
        running += amount;
        out.push(ExplainedEntry {
            txn_id: row.try_get("txn_id")?,
            txn_type: LedgerEntryType::parse(&row.try_get::<String, _>("txn_type")?)
                .map_err(|e| anyhow::anyhow!(e))?,
            amount,
            running_balance: running,
            description: row.try_get("description")?,
            operation_id: row.try_get("operation_id")?,
            created_at: row.try_get("created_at")?,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub enum RepairOutcome {
    /// Ledger already matches the cached balance.
    Clean,
    /// Compensating entry written with this request id.
    Repaired {
        request_id: String,
        amount: i64,
        txn_type: LedgerEntryType,
    },
}

/// Insert one compensating `addition`/`deduction` so the ledger sums to
/// the cached balance. The cached balance is left untouched: it is the
/// reference value the operator vouched for when invoking repair.
pub async fn repair_user(pool: &PgPool, user_id: Uuid) -> Result<RepairOutcome> {
    let mut tx = pool.begin().await.context("repair_user begin failed")?;

    // Lock the user row so no concurrent ledger mutation shifts the sum
    // between measurement and compensation.
    let balance: Option<(i64,)> =
        sqlx::query_as("select credit_balance from users where user_id = $1 for update")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await
            .context("repair_user lock failed")?;
    let Some((balance,)) = balance else {
        anyhow::bail!("repair_user: unknown user {user_id}");
    };

    let (ledger_sum,): (i64,) = sqlx::query_as(
        r#"
        select coalesce(sum(amount), 0)::bigint
        from credit_transactions
        where user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut *tx)
    .await
    .context("repair_user sum failed")?;

    let drift = balance - ledger_sum;
    if drift == 0 {
        tx.rollback().await.ok();
        return Ok(RepairOutcome::Clean);
    }

    let txn_type = if drift > 0 {
        LedgerEntryType::Addition
    } else {
        LedgerEntryType::Deduction
    };
    let request_id = format!("reconcile:{}", Uuid::new_v4());

    sqlx::query(
        r#"
        insert into credit_transactions
            (user_id, amount, txn_type, description, request_id)
        values ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(user_id)
    .bind(drift)
    .bind(txn_type.as_str())
    .bind("reconciliation repair")
    .bind(&request_id)
    .execute(&mut *tx)
    .await
    .context("repair_user insert failed")?;

    tx.commit().await.context("repair_user commit failed")?;

    Ok(RepairOutcome::Repaired {
        request_id,
        amount: drift,
        txn_type,
    })
}

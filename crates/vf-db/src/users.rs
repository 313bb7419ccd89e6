//! User rows. Balance lives here as a cache; `ledger.rs` owns mutation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use vf_schemas::UserTier;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub user_id: Uuid,
    pub email: String,
    pub tier: UserTier,
    pub credit_balance: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub user_id: Uuid,
    pub email: String,
    pub tier: UserTier,
    /// Starting balance; a matching `addition` ledger entry is written so
    /// balance-ledger equality holds from the first row.
    pub initial_credits: i64,
}

pub async fn insert_user(pool: &PgPool, user: &NewUser) -> Result<()> {
    let mut tx = pool.begin().await.context("insert_user begin failed")?;

    let res = sqlx::query(
        r#"
        insert into users (user_id, email, tier, credit_balance)
        values ($1, $2, $3, 0)
        "#,
    )
    .bind(user.user_id)
    .bind(&user.email)
    .bind(user.tier.as_str())
    .execute(&mut *tx)
    .await;

    if let Err(e) = res {
        if crate::is_unique_violation(&e, "users_email_key") {
            anyhow::bail!("email {} is already registered", user.email);
        }
        return Err(anyhow::Error::new(e).context("insert_user failed"));
    }

    if user.initial_credits > 0 {
        crate::ledger::add_credits_tx(
            &mut tx,
            user.user_id,
            user.initial_credits,
            "signup grant",
            None,
        )
        .await
        .map_err(anyhow::Error::new)
        .context("insert_user signup grant failed")?;
    }

    tx.commit().await.context("insert_user commit failed")?;
    Ok(())
}

pub async fn fetch_user(pool: &PgPool, user_id: Uuid) -> Result<Option<UserRow>> {
    let row = sqlx::query(
        r#"
        select user_id, email, tier, credit_balance, created_at
        from users
        where user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("fetch_user failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(UserRow {
        user_id: row.try_get("user_id")?,
        email: row.try_get("email")?,
        tier: UserTier::parse(&row.try_get::<String, _>("tier")?)
            .map_err(|e| anyhow::anyhow!(e))?,
        credit_balance: row.try_get("credit_balance")?,
        created_at: row.try_get("created_at")?,
    }))
}

/// All users, for the reconciliation sweep. Ordered by creation time so
/// reports are stable.
pub async fn list_users(pool: &PgPool) -> Result<Vec<UserRow>> {
    let rows = sqlx::query(
        r#"
        select user_id, email, tier, credit_balance, created_at
        from users
        order by created_at asc, user_id asc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_users failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(UserRow {
            user_id: row.try_get("user_id")?,
            email: row.try_get("email")?,
            tier: UserTier::parse(&row.try_get::<String, _>("tier")?)
                .map_err(|e| anyhow::anyhow!(e))?,
            credit_balance: row.try_get("credit_balance")?,
            created_at: row.try_get("created_at")?,
        });
    }
    Ok(out)
}

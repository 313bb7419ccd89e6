//! vf-db
//!
//! Postgres layer for vidforge: users and assets, the operation store,
//! the append-only credit ledger and the transactional outbox. All
//! functions are free async fns over an executor; `*_tx` variants take
//! `&mut PgConnection` so the submission and finalizer paths can compose
//! several stores into one transaction.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod assets;
pub mod ledger;
pub mod operations;
pub mod outbox;
pub mod reconcile;
pub mod users;

pub use assets::{fetch_asset, insert_image, insert_video, AssetRow, NewAsset};
pub use ledger::{
    add_credits, add_credits_tx, capture, capture_tx, find_dangling_reservations, get_balance,
    list_transactions, release, release_tx, reserve, reserve_tx, DanglingReservation,
    LedgerEntryRow, LedgerError, ReleaseOutcome,
};
pub use operations::{
    add_operation_tx, fetch_operation, fetch_operation_any, find_operation,
    list_recoverable_operations, update_status, update_status_tx, NewOperation, OperationRow,
};
pub use outbox::{
    outbox_fetch_by_key, outbox_insert_tx, outbox_mark_failed, outbox_mark_published,
    outbox_pending_count, outbox_prune_published, NewOutboxEvent, OutboxEventRow,
};
#[cfg(any(feature = "runtime-claim", feature = "testkit"))]
pub use outbox::{outbox_claim_batch, ClaimedOutboxEvent};
pub use reconcile::{drift_report, explain_user, repair_user, DriftRow, ExplainedEntry, RepairOutcome};
pub use users::{fetch_user, insert_user, list_users, NewUser, UserRow};

pub const ENV_DB_URL: &str = "VF_DATABASE_URL";

/// Connect to Postgres using VF_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url, 10).await
}

pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Test helper used by integration tests:
/// - Connect using VF_DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='outbox_events'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_schema: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_schema: bool,
}

/// Detect a Postgres unique constraint violation by constraint name.
pub(crate) fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.constraint() == Some(constraint)
                || (db_err.code().as_deref() == Some("23505")
                    && db_err.constraint() == Some(constraint))
        }
        _ => false,
    }
}

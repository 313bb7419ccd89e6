//! vf-runtime
//!
//! Background loops that keep the triad honest: the outbox dispatcher
//! (claim → publish → mark) and the reservation janitor. Both are safe to
//! run on every node; the claim protocol and the ledger idempotency make
//! overlap harmless.

pub mod dispatcher;

pub use dispatcher::{dispatch_once, dispatcher_id, run_dispatcher, DispatchReport};

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info};

use vf_bus::EventBus;
use vf_config::AppConfig;

/// Periodic janitor loop (default every 30 min).
pub async fn run_janitor(
    pool: PgPool,
    cfg: Arc<AppConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(cfg.janitor_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                // A closed channel means the process is going away.
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
        if *shutdown.borrow() {
            return;
        }

        match vf_jobs::run_janitor_pass(&pool, cfg.reservation_ttl).await {
            Ok(report) if report.scanned > 0 => {
                info!(
                    scanned = report.scanned,
                    captured = report.captured,
                    released = report.released,
                    stuck_failed = report.stuck_failed,
                    "janitor pass complete"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "janitor pass failed"),
        }
    }
}

/// Spawn dispatcher + janitor; resolves when both exit after shutdown.
pub async fn run_runtime(
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    cfg: Arc<AppConfig>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let dispatcher = tokio::spawn(run_dispatcher(
        pool.clone(),
        bus,
        Arc::clone(&cfg),
        shutdown.clone(),
    ));
    let janitor = tokio::spawn(run_janitor(pool, cfg, shutdown));

    let _ = dispatcher.await;
    let _ = janitor.await;
    Ok(())
}

//! vf-worker entry point.
//!
//! Thin by design: tracing, config, shutdown wiring. The run loop lives
//! in the library so tests can drive it.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Silent if the file does not exist; production injects env vars.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cfg = Arc::new(vf_config::AppConfig::from_env()?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received; draining");
            let _ = shutdown_tx.send(true);
        }
    });

    vf_worker::run_worker(cfg, shutdown_rx).await
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

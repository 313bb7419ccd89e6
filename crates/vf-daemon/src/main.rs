//! vf-daemon entry point.
//!
//! This file is intentionally thin: tracing, config, fan-out wiring,
//! middleware, serve. Route handlers live in `routes.rs`, state in
//! `state.rs`, fan-out in `fanout.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use vf_bus::{AmqpEventBus, EventBus};
use vf_daemon::{build_router, spawn_bus_fanout, spawn_queue_fanout, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Silent if the file does not exist; production injects env vars.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cfg = vf_config::AppConfig::from_env()?;
    let state = Arc::new(AppState::new());

    // Durable events from the AMQP bus.
    let bus: Arc<dyn EventBus> = Arc::new(AmqpEventBus::connect(&cfg.amqp_url).await?);
    spawn_bus_fanout(Arc::clone(&state.registry), bus).await?;

    // Ephemeral queue notices from Redis pub/sub.
    let notices = vf_bus::queue_notice_stream(&cfg.redis_url, "vfq:events").await?;
    spawn_queue_fanout(Arc::clone(&state.registry), notices);

    let app = build_router(Arc::clone(&state))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr: SocketAddr = cfg
        .daemon_addr
        .as_deref()
        .unwrap_or("127.0.0.1:8790")
        .parse()
        .context("invalid VF_DAEMON_ADDR")?;
    info!("vf-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// CORS: allow only localhost origins (the web UI is served separately).
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}

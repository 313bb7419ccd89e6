//! Axum router and the WebSocket endpoint.
//!
//! `build_router` is the single entry point; `main.rs` attaches
//! middleware layers after this call so tests can use the bare router.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state::AppState;

/// Outbound mailbox depth per socket connection.
const CONNECTION_BUFFER: usize = 64;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "ok": true,
            "service": st.build.service,
            "version": st.build.version,
        })),
    )
}

// ---------------------------------------------------------------------------
// GET /ws
// ---------------------------------------------------------------------------

/// Client frames:
/// `{"action": "subscribe", "resourceId": "<asset or user id>"}` and the
/// matching `unsubscribe`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientFrame {
    action: String,
    resource_id: String,
}

pub(crate) async fn ws_upgrade(
    State(st): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(st, socket))
}

async fn handle_socket(st: Arc<AppState>, mut socket: WebSocket) {
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(CONNECTION_BUFFER);
    info!(%conn_id, "socket connected");

    loop {
        tokio::select! {
            // Fan-out → socket.
            outbound = rx.recv() => {
                let Some(msg) = outbound else { break };
                match serde_json::to_string(&msg) {
                    Ok(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "socket message serialization failed"),
                }
            }

            // Socket → subscription changes.
            inbound = socket.recv() => {
                let Some(Ok(frame)) = inbound else { break };
                match frame {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(f) if f.action == "subscribe" => {
                                st.registry
                                    .subscribe(&f.resource_id, conn_id, tx.clone())
                                    .await;
                            }
                            Ok(f) if f.action == "unsubscribe" => {
                                st.registry.unsubscribe(&f.resource_id, conn_id).await;
                            }
                            Ok(f) => {
                                debug!(action = f.action, "unknown socket action ignored");
                            }
                            Err(e) => {
                                debug!(error = %e, "undecodable socket frame ignored");
                            }
                        }
                    }
                    Message::Close(_) => break,
                    // Axum answers pings itself; everything else is noise.
                    _ => {}
                }
            }
        }
    }

    st.registry.drop_connection(conn_id).await;
    info!(%conn_id, "socket disconnected");
}

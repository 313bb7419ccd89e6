//! Scenario: WebSocket subscribers receive exactly their resource's events.
//!
//! Runs fully in-process: real Axum server on an ephemeral port, real
//! WebSocket client, in-memory bus instead of AMQP, a plain channel
//! instead of Redis pub/sub. No external services needed.

use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use vf_bus::{EventBus, MemoryEventBus};
use vf_daemon::{build_router, spawn_bus_fanout, spawn_queue_fanout, AppState};
use vf_schemas::events::{QueueEvent, QueueNotice};
use vf_schemas::{AssetKind, EventEnvelope, OperationType};

struct Harness {
    addr: std::net::SocketAddr,
    bus: Arc<MemoryEventBus>,
    notices: mpsc::Sender<QueueNotice>,
}

async fn start_daemon() -> Harness {
    let state = Arc::new(AppState::new());
    let bus = Arc::new(MemoryEventBus::new());

    spawn_bus_fanout(Arc::clone(&state.registry), bus.clone() as Arc<dyn EventBus>)
        .await
        .expect("bus fanout");

    let (notice_tx, notice_rx) = mpsc::channel(64);
    spawn_queue_fanout(Arc::clone(&state.registry), notice_rx);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    Harness {
        addr,
        bus,
        notices: notice_tx,
    }
}

async fn connect_and_subscribe(
    addr: std::net::SocketAddr,
    resource_id: &str,
) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("ws connect");
    ws.send(Message::Text(
        json!({"action": "subscribe", "resourceId": resource_id}).to_string(),
    ))
    .await
    .expect("subscribe frame");
    // Give the server a beat to register the subscription.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    ws
}

async fn next_json(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> serde_json::Value {
    let msg = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for socket message")
        .expect("stream ended")
        .expect("socket error");
    serde_json::from_str(msg.to_text().expect("text frame")).expect("json")
}

fn completed_envelope(asset_id: Uuid) -> EventEnvelope {
    let operation_id = Uuid::new_v4();
    EventEnvelope {
        outbox_id: Uuid::new_v4(),
        event_type: "job.completed".into(),
        aggregate_type: "video".into(),
        aggregate_id: asset_id.to_string(),
        idempotency_key: format!("op:{operation_id}:completed"),
        correlation_id: Uuid::new_v4(),
        occurred_at: Utc::now(),
        payload: json!({
            "operationId": operation_id,
            "type": "resize",
            "videoId": asset_id,
            "result": "storage/x/resized_1280x720.mp4",
        }),
    }
}

#[tokio::test]
async fn subscriber_receives_progress_and_completion() {
    let h = start_daemon().await;
    let asset_id = Uuid::new_v4();
    let mut ws = connect_and_subscribe(h.addr, &asset_id.to_string()).await;

    // Ephemeral channel: job:progress.
    h.notices
        .send(QueueNotice {
            job_id: "7".into(),
            operation_id: Uuid::new_v4(),
            asset_kind: AssetKind::Video,
            asset_id,
            op_type: OperationType::Resize,
            at: Utc::now(),
            event: QueueEvent::Progress { pct: 40 },
        })
        .await
        .unwrap();

    let msg = next_json(&mut ws).await;
    assert_eq!(msg["event"], "job:progress");
    assert_eq!(msg["payload"]["progress"], 40);
    assert_eq!(msg["payload"]["videoId"], asset_id.to_string());

    // Durable channel: job.completed via the bus.
    h.bus.publish(&completed_envelope(asset_id)).await.unwrap();

    let msg = next_json(&mut ws).await;
    assert_eq!(msg["event"], "job:completed");
    assert_eq!(msg["payload"]["result"], "storage/x/resized_1280x720.mp4");
}

#[tokio::test]
async fn events_do_not_leak_across_resources() {
    let h = start_daemon().await;
    let mine = Uuid::new_v4();
    let theirs = Uuid::new_v4();
    let mut ws = connect_and_subscribe(h.addr, &mine.to_string()).await;

    // Someone else's completion first, then mine.
    h.bus.publish(&completed_envelope(theirs)).await.unwrap();
    h.bus.publish(&completed_envelope(mine)).await.unwrap();

    let msg = next_json(&mut ws).await;
    assert_eq!(
        msg["payload"]["videoId"],
        mine.to_string(),
        "only the subscribed resource's event may arrive"
    );
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let h = start_daemon().await;
    let asset_id = Uuid::new_v4();
    let mut ws = connect_and_subscribe(h.addr, &asset_id.to_string()).await;

    ws.send(Message::Text(
        json!({"action": "unsubscribe", "resourceId": asset_id}).to_string(),
    ))
    .await
    .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    h.bus.publish(&completed_envelope(asset_id)).await.unwrap();

    // Nothing should arrive; expect the read to time out.
    let got = tokio::time::timeout(std::time::Duration::from_millis(500), ws.next()).await;
    assert!(got.is_err(), "no message may arrive after unsubscribe");
}

/// Drain every socket message that arrives within `window`.
async fn collect_for(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    window: std::time::Duration,
) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return out;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(msg))) => {
                if let Ok(text) = msg.to_text() {
                    if let Ok(v) = serde_json::from_str(text) {
                        out.push(v);
                    }
                }
            }
            _ => return out,
        }
    }
}

#[tokio::test]
async fn terminal_events_arrive_exactly_once() {
    let h = start_daemon().await;
    let asset_id = Uuid::new_v4();
    let mut ws = connect_and_subscribe(h.addr, &asset_id.to_string()).await;

    // A real run emits BOTH a terminal queue notice (internal channel)
    // and the durable bus envelope for the same operation. Only the bus
    // copy may reach the socket.
    h.notices
        .send(QueueNotice {
            job_id: "9".into(),
            operation_id: Uuid::new_v4(),
            asset_kind: AssetKind::Video,
            asset_id,
            op_type: OperationType::Resize,
            at: Utc::now(),
            event: QueueEvent::Completed {
                result_path: "storage/x/resized_1280x720.mp4".into(),
            },
        })
        .await
        .unwrap();
    h.bus.publish(&completed_envelope(asset_id)).await.unwrap();

    let msgs = collect_for(&mut ws, std::time::Duration::from_secs(1)).await;
    let completed: Vec<_> = msgs
        .iter()
        .filter(|m| m["event"] == "job:completed")
        .collect();
    assert_eq!(
        completed.len(),
        1,
        "exactly one job:completed may arrive, got {msgs:?}"
    );

    // Same invariant on the failure side.
    let failed_asset = Uuid::new_v4();
    let mut ws = connect_and_subscribe(h.addr, &failed_asset.to_string()).await;
    let operation_id = Uuid::new_v4();

    h.notices
        .send(QueueNotice {
            job_id: "10".into(),
            operation_id,
            asset_kind: AssetKind::Video,
            asset_id: failed_asset,
            op_type: OperationType::Resize,
            at: Utc::now(),
            event: QueueEvent::Failed {
                error: "transcoder exited with 1".into(),
            },
        })
        .await
        .unwrap();
    h.bus
        .publish(&EventEnvelope {
            outbox_id: Uuid::new_v4(),
            event_type: "job.failed".into(),
            aggregate_type: "video".into(),
            aggregate_id: failed_asset.to_string(),
            idempotency_key: format!("op:{operation_id}:failed"),
            correlation_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            payload: json!({
                "operationId": operation_id,
                "type": "resize",
                "videoId": failed_asset,
                "error": "transcoder exited with 1",
            }),
        })
        .await
        .unwrap();

    let msgs = collect_for(&mut ws, std::time::Duration::from_secs(1)).await;
    let failed: Vec<_> = msgs.iter().filter(|m| m["event"] == "job:failed").collect();
    assert_eq!(
        failed.len(),
        1,
        "exactly one job:failed may arrive, got {msgs:?}"
    );
}

#[tokio::test]
async fn billing_events_are_not_socket_facing() {
    let h = start_daemon().await;
    let user_id = Uuid::new_v4();
    let mut ws = connect_and_subscribe(h.addr, &user_id.to_string()).await;

    h.bus
        .publish(&EventEnvelope {
            outbox_id: Uuid::new_v4(),
            event_type: "billing.reservation.reserved".into(),
            aggregate_type: "user".into(),
            aggregate_id: user_id.to_string(),
            idempotency_key: format!("op-{}:reserved", Uuid::new_v4()),
            correlation_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            payload: json!({"balance": 9}),
        })
        .await
        .unwrap();

    let got = tokio::time::timeout(std::time::Duration::from_millis(500), ws.next()).await;
    assert!(got.is_err(), "billing events are internal");
}

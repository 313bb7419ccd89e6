//! Event shapes shared by the outbox, the bus, the queue and the socket
//! layer.
//!
//! Two channels exist on purpose (see DESIGN.md): durable lifecycle facts
//! travel outbox → AMQP as [`EventEnvelope`]s; ephemeral queue lifecycle
//! (`queued`/`started`/`progress`) travels Redis pub/sub as
//! [`QueueNotice`]s. Both converge into [`SocketMessage`]s at the fan-out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{AssetKind, OperationType};

// ---------------------------------------------------------------------------
// Durable event types
// ---------------------------------------------------------------------------

pub const EVENT_JOB_SUBMITTED: &str = "job.submitted";
pub const EVENT_JOB_COMPLETED: &str = "job.completed";
pub const EVENT_JOB_FAILED: &str = "job.failed";
pub const EVENT_RESERVATION_RESERVED: &str = "billing.reservation.reserved";
pub const EVENT_RESERVATION_CAPTURED: &str = "billing.reservation.captured";
pub const EVENT_RESERVATION_RELEASED: &str = "billing.reservation.released";

/// Outbox idempotency key for a job lifecycle event: `op:<id>:<suffix>`.
pub fn op_event_key(operation_id: Uuid, suffix: &str) -> String {
    format!("op:{operation_id}:{suffix}")
}

// ---------------------------------------------------------------------------
// EventEnvelope
// ---------------------------------------------------------------------------

/// The shape a durable event takes on the bus. Field names mirror the
/// outbox columns; consumers dedupe on `idempotency_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub outbox_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub idempotency_key: String,
    pub correlation_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// Trace context
// ---------------------------------------------------------------------------

/// Trace context propagated through job payloads so worker spans join the
/// submitting request's trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub correlation_id: Uuid,
    /// W3C traceparent header value when the submitter had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
}

impl TraceContext {
    pub fn new(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            traceparent: None,
        }
    }
}

/// Envelope wrapping every queue payload: `{trace, payload}`.
/// The worker extracts `trace` on dequeue and records it on its span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEnvelope<T> {
    pub trace: TraceContext,
    pub payload: T,
}

// ---------------------------------------------------------------------------
// Job payload
// ---------------------------------------------------------------------------

/// What a queued job carries. `operation_id` is the authoritative
/// backreference; everything else is a convenience snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub operation_id: Uuid,
    pub user_id: Uuid,
    pub asset_kind: AssetKind,
    pub asset_id: Uuid,
    pub op_type: OperationType,
    pub parameters: crate::OperationParameters,
    pub source_path: String,
}

// ---------------------------------------------------------------------------
// Queue lifecycle events (ephemeral channel)
// ---------------------------------------------------------------------------

/// Typed queue lifecycle event, replacing the source's callback soup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueEvent {
    Queued,
    Started,
    Progress { pct: u8 },
    Completed { result_path: String },
    Failed { error: String },
}

/// A queue event plus enough addressing to demultiplex it to sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueNotice {
    pub job_id: String,
    pub operation_id: Uuid,
    pub asset_kind: AssetKind,
    pub asset_id: Uuid,
    pub op_type: OperationType,
    pub at: DateTime<Utc>,
    pub event: QueueEvent,
}

// ---------------------------------------------------------------------------
// Socket messages
// ---------------------------------------------------------------------------

/// Wire shape pushed to WebSocket subscribers:
/// `{ event: "job:...", payload: {...} }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketMessage {
    pub event: String,
    pub payload: Value,
}

impl SocketMessage {
    /// Translate an ephemeral queue notice into a socket message, or
    /// `None` for kinds the socket layer must not source from this
    /// channel.
    ///
    /// Only `queued`/`started`/`progress` are socket-facing here.
    /// `Completed`/`Failed` notices stay internal: their socket events
    /// come from the durable outbox → bus path, so a subscriber sees each
    /// terminal event exactly once.
    pub fn from_queue_notice(n: &QueueNotice) -> Option<Self> {
        let (event, extra) = match &n.event {
            QueueEvent::Queued => ("job:queued", json!({})),
            QueueEvent::Started => ("job:started", json!({})),
            QueueEvent::Progress { pct } => ("job:progress", json!({ "progress": pct })),
            QueueEvent::Completed { .. } | QueueEvent::Failed { .. } => return None,
        };

        let mut payload = json!({
            "jobId": n.job_id,
            "type": n.op_type.as_str(),
            "at": n.at,
        });
        if let Value::Object(map) = &mut payload {
            map.insert(
                n.asset_kind.payload_id_field().to_string(),
                json!(n.asset_id),
            );
        }
        merge_object(&mut payload, extra);

        Some(Self {
            event: event.to_string(),
            payload,
        })
    }

    /// Translate a durable bus envelope into a socket message, or `None`
    /// for event types the socket layer does not surface.
    pub fn from_envelope(env: &EventEnvelope) -> Option<Self> {
        let event = match env.event_type.as_str() {
            EVENT_JOB_COMPLETED => "job:completed",
            EVENT_JOB_FAILED => "job:failed",
            // job.submitted duplicates the ephemeral job:queued; billing
            // events are not socket-facing.
            _ => return None,
        };
        Some(Self {
            event: event.to_string(),
            payload: env.payload.clone(),
        })
    }
}

fn merge_object(dst: &mut Value, src: Value) {
    if let (Value::Object(dst_map), Value::Object(src_map)) = (dst, src) {
        for (k, v) in src_map {
            dst_map.insert(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(event: QueueEvent) -> QueueNotice {
        QueueNotice {
            job_id: "42".into(),
            operation_id: Uuid::nil(),
            asset_kind: AssetKind::Video,
            asset_id: Uuid::nil(),
            op_type: OperationType::Resize,
            at: Utc::now(),
            event,
        }
    }

    #[test]
    fn progress_notice_becomes_job_progress() {
        let msg = SocketMessage::from_queue_notice(&notice(QueueEvent::Progress { pct: 40 }))
            .expect("progress is socket-facing");
        assert_eq!(msg.event, "job:progress");
        assert_eq!(msg.payload["progress"], 40);
        assert_eq!(msg.payload["videoId"], Uuid::nil().to_string());
        assert_eq!(msg.payload["type"], "resize");
    }

    #[test]
    fn image_notice_uses_image_id_field() {
        let mut n = notice(QueueEvent::Queued);
        n.asset_kind = AssetKind::Image;
        n.op_type = OperationType::ResizeImage;
        let msg = SocketMessage::from_queue_notice(&n).expect("queued is socket-facing");
        assert!(msg.payload.get("imageId").is_some());
        assert!(msg.payload.get("videoId").is_none());
    }

    #[test]
    fn terminal_notices_are_not_socket_facing() {
        // job:completed / job:failed reach sockets via the durable bus
        // only; the queue-channel copies must be dropped here.
        assert!(SocketMessage::from_queue_notice(&notice(QueueEvent::Completed {
            result_path: "storage/x/out.mp4".into(),
        }))
        .is_none());
        assert!(SocketMessage::from_queue_notice(&notice(QueueEvent::Failed {
            error: "boom".into(),
        }))
        .is_none());
    }

    #[test]
    fn billing_envelopes_are_not_socket_facing() {
        let env = EventEnvelope {
            outbox_id: Uuid::nil(),
            event_type: EVENT_RESERVATION_RESERVED.into(),
            aggregate_type: "user".into(),
            aggregate_id: Uuid::nil().to_string(),
            idempotency_key: "op:x:reserved".into(),
            correlation_id: Uuid::nil(),
            occurred_at: Utc::now(),
            payload: json!({}),
        };
        assert!(SocketMessage::from_envelope(&env).is_none());
    }

    #[test]
    fn op_event_key_shape() {
        let id = Uuid::nil();
        assert_eq!(op_event_key(id, "completed"), format!("op:{id}:completed"));
    }
}

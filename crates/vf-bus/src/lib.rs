//! vf-bus
//!
//! The event-bus seam. Durable events leave the system exclusively through
//! the outbox dispatcher publishing on an [`EventBus`]; the daemon's
//! fan-out consumes the same trait. Two implementations:
//!
//! - [`AmqpEventBus`]: lapin against a topic exchange with a dead-letter
//!   exchange, for deployments.
//! - [`MemoryEventBus`]: in-process topic matching, for tests and the
//!   scenario harness.
//!
//! Ephemeral queue lifecycle notices travel a separate channel (Redis
//! pub/sub); [`queue_notice_stream`] adapts that into an mpsc receiver.

mod amqp;
mod memory;
mod redis_stream;

pub use amqp::AmqpEventBus;
pub use memory::MemoryEventBus;
pub use redis_stream::queue_notice_stream;

use tokio::sync::mpsc;

use vf_schemas::EventEnvelope;

/// A live subscription: envelopes matching the requested patterns arrive
/// on `rx` until the bus (or its backing connection) goes away.
pub struct BusSubscription {
    pub rx: mpsc::Receiver<EventEnvelope>,
}

#[async_trait::async_trait]
pub trait EventBus: Send + Sync {
    /// Publish one envelope under its `event_type` as the routing key.
    async fn publish(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;

    /// Subscribe to routing-key patterns (AMQP topic grammar: `*` one
    /// word, `#` zero or more).
    async fn subscribe(&self, patterns: &[&str]) -> anyhow::Result<BusSubscription>;
}

/// AMQP-style topic match. Segments split on `.`; `*` matches exactly one
/// segment, `#` matches the rest.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut key = routing_key.split('.');

    loop {
        match (pat.next(), key.next()) {
            (None, None) => return true,
            (Some("#"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(k)) if p == k => continue,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_grammar() {
        assert!(topic_matches("job.*", "job.completed"));
        assert!(!topic_matches("job.*", "billing.reservation.reserved"));
        assert!(topic_matches(
            "billing.reservation.*",
            "billing.reservation.released"
        ));
        assert!(!topic_matches("billing.reservation.*", "billing.reservation"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("job.completed", "job.completed"));
        assert!(!topic_matches("job.completed", "job.failed"));
        assert!(!topic_matches("job.*.extra", "job.completed"));
    }
}

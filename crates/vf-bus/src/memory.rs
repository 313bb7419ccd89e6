//! In-process bus double with the same topic semantics as the AMQP
//! implementation. Deterministic collaborator for scenario tests: it also
//! journals everything it publishes.

use std::sync::Mutex;

use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;

use vf_schemas::EventEnvelope;

use crate::{topic_matches, BusSubscription, EventBus};

pub struct MemoryEventBus {
    tx: broadcast::Sender<EventEnvelope>,
    journal: Mutex<Vec<EventEnvelope>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<EventEnvelope> {
        self.journal.lock().expect("journal poisoned").clone()
    }

    /// Event types published so far, in order (assertion helper).
    pub fn published_types(&self) -> Vec<String> {
        self.published().into_iter().map(|e| e.event_type).collect()
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        self.journal
            .lock()
            .expect("journal poisoned")
            .push(envelope.clone());
        // No receivers is fine; the journal already has it.
        let _ = self.tx.send(envelope.clone());
        Ok(())
    }

    async fn subscribe(&self, patterns: &[&str]) -> anyhow::Result<BusSubscription> {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        let (tx, rx) = mpsc::channel(256);

        // Lagged receivers just skip; the journal keeps the full record.
        let mut stream = BroadcastStream::new(self.tx.subscribe())
            .filter_map(|item| async move { item.ok() })
            .boxed();

        tokio::spawn(async move {
            while let Some(env) = stream.next().await {
                if patterns.iter().any(|p| topic_matches(p, &env.event_type))
                    && tx.send(env).await.is_err()
                {
                    return;
                }
            }
        });

        Ok(BusSubscription { rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn env(event_type: &str) -> EventEnvelope {
        EventEnvelope {
            outbox_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            aggregate_type: "video".into(),
            aggregate_id: Uuid::new_v4().to_string(),
            idempotency_key: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn subscription_filters_by_pattern() {
        let bus = MemoryEventBus::new();
        let mut sub = bus.subscribe(&["job.*"]).await.unwrap();

        bus.publish(&env("billing.reservation.reserved"))
            .await
            .unwrap();
        bus.publish(&env("job.completed")).await.unwrap();

        let got = sub.rx.recv().await.unwrap();
        assert_eq!(got.event_type, "job.completed");
        assert_eq!(
            bus.published_types(),
            vec!["billing.reservation.reserved", "job.completed"]
        );
    }
}

//! Shared runtime state for vf-daemon.
//!
//! The heart is the [`SubscriptionRegistry`]: `resource_id → connections`.
//! Handlers receive `State<Arc<AppState>>` from Axum; this module owns
//! nothing async itself beyond the registry lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use vf_schemas::SocketMessage;

/// Per-connection outbound mailbox. Bounded: a stuck socket drops events
/// rather than backing the fan-out up.
pub type ConnectionSender = mpsc::Sender<SocketMessage>;

#[derive(Default)]
struct RegistryInner {
    /// resource_id → (connection → sender)
    by_resource: HashMap<String, HashMap<Uuid, ConnectionSender>>,
    /// connection → resources, for teardown.
    by_connection: HashMap<Uuid, HashSet<String>>,
}

/// `subscribe(resource_id)` / `unsubscribe(resource_id)` bookkeeping and
/// the demultiplex point for both event channels.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, resource_id: &str, conn_id: Uuid, sender: ConnectionSender) {
        let mut inner = self.inner.write().await;
        inner
            .by_resource
            .entry(resource_id.to_string())
            .or_default()
            .insert(conn_id, sender);
        inner
            .by_connection
            .entry(conn_id)
            .or_default()
            .insert(resource_id.to_string());
        debug!(resource_id, %conn_id, "subscribed");
    }

    pub async fn unsubscribe(&self, resource_id: &str, conn_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(conns) = inner.by_resource.get_mut(resource_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                inner.by_resource.remove(resource_id);
            }
        }
        if let Some(resources) = inner.by_connection.get_mut(&conn_id) {
            resources.remove(resource_id);
        }
    }

    /// Remove every subscription a closed connection held.
    pub async fn drop_connection(&self, conn_id: Uuid) {
        let mut inner = self.inner.write().await;
        let resources = inner.by_connection.remove(&conn_id).unwrap_or_default();
        for resource_id in resources {
            if let Some(conns) = inner.by_resource.get_mut(&resource_id) {
                conns.remove(&conn_id);
                if conns.is_empty() {
                    inner.by_resource.remove(&resource_id);
                }
            }
        }
    }

    /// Push a message to every connection subscribed to `resource_id`.
    /// Full mailboxes are skipped (slow consumer sheds load).
    pub async fn publish(&self, resource_id: &str, msg: &SocketMessage) {
        let inner = self.inner.read().await;
        let Some(conns) = inner.by_resource.get(resource_id) else {
            return;
        };
        for sender in conns.values() {
            let _ = sender.try_send(msg.clone());
        }
    }

    pub async fn subscriber_count(&self, resource_id: &str) -> usize {
        let inner = self.inner.read().await;
        inner
            .by_resource
            .get(resource_id)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

/// Static build metadata included in health responses.
#[derive(Clone, Debug, serde::Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SubscriptionRegistry>,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(SubscriptionRegistry::new()),
            build: BuildInfo {
                service: "vf-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg() -> SocketMessage {
        SocketMessage {
            event: "job:progress".into(),
            payload: json!({"progress": 50}),
        }
    }

    #[tokio::test]
    async fn publish_reaches_only_subscribers_of_that_resource() {
        let reg = SubscriptionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();

        reg.subscribe("video-1", conn_a, tx_a).await;
        reg.subscribe("video-2", conn_b, tx_b).await;

        reg.publish("video-1", &msg()).await;

        assert_eq!(rx_a.recv().await.unwrap().event, "job:progress");
        assert!(rx_b.try_recv().is_err(), "other resource got the message");
    }

    #[tokio::test]
    async fn unsubscribe_and_drop_stop_delivery() {
        let reg = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Uuid::new_v4();

        reg.subscribe("video-1", conn, tx.clone()).await;
        reg.subscribe("video-2", conn, tx).await;
        assert_eq!(reg.subscriber_count("video-1").await, 1);

        reg.unsubscribe("video-1", conn).await;
        reg.publish("video-1", &msg()).await;
        assert!(rx.try_recv().is_err());

        reg.drop_connection(conn).await;
        assert_eq!(reg.subscriber_count("video-2").await, 0);
    }
}

//! Event fan-out: one bus consumer and one queue-notice consumer per
//! node, both demultiplexing into the subscription registry by
//! aggregate/asset id.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info};

use vf_bus::EventBus;
use vf_schemas::events::QueueNotice;
use vf_schemas::SocketMessage;

use crate::state::SubscriptionRegistry;

/// Routing-key patterns the node-local consumer binds.
pub const BUS_PATTERNS: [&str; 2] = ["job.*", "billing.reservation.*"];

/// Subscribe to the durable bus and forward socket-facing events.
///
/// `job.completed` / `job.failed` go out to subscribers of the aggregate
/// (the asset id); billing events address the user aggregate, so a client
/// subscribed to its own user id sees those too.
pub async fn spawn_bus_fanout(
    registry: Arc<SubscriptionRegistry>,
    bus: Arc<dyn EventBus>,
) -> Result<()> {
    let mut sub = bus.subscribe(&BUS_PATTERNS).await?;

    tokio::spawn(async move {
        info!("bus fan-out consumer started");
        while let Some(envelope) = sub.rx.recv().await {
            let Some(msg) = SocketMessage::from_envelope(&envelope) else {
                continue;
            };
            registry.publish(&envelope.aggregate_id, &msg).await;
        }
        error!("bus fan-out consumer stream ended");
    });

    Ok(())
}

/// Forward ephemeral queue notices (`job:queued|started|progress`) from
/// the Redis channel into the registry.
///
/// `Completed`/`Failed` notices are dropped here: their socket events
/// arrive through [`spawn_bus_fanout`] from the outbox, and forwarding
/// both copies would deliver every terminal event twice.
pub fn spawn_queue_fanout(
    registry: Arc<SubscriptionRegistry>,
    mut notices: mpsc::Receiver<QueueNotice>,
) {
    tokio::spawn(async move {
        info!("queue fan-out consumer started");
        while let Some(notice) = notices.recv().await {
            let Some(msg) = SocketMessage::from_queue_notice(&notice) else {
                continue;
            };
            registry.publish(&notice.asset_id.to_string(), &msg).await;
        }
        error!("queue fan-out consumer stream ended");
    });
}

//! Redis pub/sub adapter for ephemeral queue notices.
//!
//! The queue publishes `QueueNotice` JSON on `<prefix>:events`; every
//! daemon node subscribes here, which is what makes `job:progress` reach
//! a socket connected to a different node than the worker.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::warn;

use vf_schemas::events::QueueNotice;

/// Subscribe to the queue notice channel; notices arrive on the returned
/// receiver until the connection drops or the receiver is closed.
pub async fn queue_notice_stream(
    redis_url: &str,
    channel: &str,
) -> Result<mpsc::Receiver<QueueNotice>> {
    let client = redis::Client::open(redis_url).context("invalid redis url")?;
    let conn = client
        .get_async_connection()
        .await
        .context("redis pubsub connect failed")?;
    let mut pubsub = conn.into_pubsub();
    pubsub
        .subscribe(channel)
        .await
        .context("redis subscribe failed")?;

    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "queue notice payload read failed");
                    continue;
                }
            };
            match serde_json::from_str::<QueueNotice>(&payload) {
                Ok(notice) => {
                    if tx.send(notice).await.is_err() {
                        return; // consumer gone
                    }
                }
                Err(e) => warn!(error = %e, "undecodable queue notice dropped"),
            }
        }
    });

    Ok(rx)
}

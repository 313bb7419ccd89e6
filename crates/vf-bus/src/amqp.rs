//! AMQP implementation over lapin.
//!
//! Topology: a durable topic exchange (`vidforge.events`) plus a durable
//! dead-letter exchange (`vidforge.dlx`). Subscriber queues are declared
//! with `x-dead-letter-exchange`, so a consumer that nacks a delivery
//! past its retry budget dead-letters instead of poisoning the queue.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::mpsc;
use tracing::{error, warn};

use vf_config::{DEAD_LETTER_EXCHANGE, EVENT_EXCHANGE};
use vf_schemas::EventEnvelope;

use crate::{BusSubscription, EventBus};

pub struct AmqpEventBus {
    conn: Connection,
    publish_channel: Channel,
}

impl AmqpEventBus {
    /// Connect and declare the exchange topology.
    pub async fn connect(amqp_url: &str) -> Result<Self> {
        let conn = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .context("amqp connect failed")?;
        let channel = conn
            .create_channel()
            .await
            .context("amqp channel open failed")?;

        // Publisher confirms: the dispatcher must not mark an outbox row
        // published until the broker owns the message.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("amqp confirm_select failed")?;

        for exchange in [EVENT_EXCHANGE, DEAD_LETTER_EXCHANGE] {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .with_context(|| format!("exchange declare failed: {exchange}"))?;
        }

        Ok(Self {
            conn,
            publish_channel: channel,
        })
    }
}

fn headers_for(envelope: &EventEnvelope) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        "aggregateType".into(),
        AMQPValue::LongString(envelope.aggregate_type.clone().into()),
    );
    headers.insert(
        "aggregateId".into(),
        AMQPValue::LongString(envelope.aggregate_id.clone().into()),
    );
    headers.insert(
        "idempotencyKey".into(),
        AMQPValue::LongString(envelope.idempotency_key.clone().into()),
    );
    headers.insert(
        "outboxId".into(),
        AMQPValue::LongString(envelope.outbox_id.to_string().into()),
    );
    headers
}

#[async_trait::async_trait]
impl EventBus for AmqpEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        let body = serde_json::to_vec(envelope).context("envelope serialization failed")?;

        let confirm = self
            .publish_channel
            .basic_publish(
                EVENT_EXCHANGE,
                &envelope.event_type,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_message_id(envelope.outbox_id.to_string().into())
                    .with_correlation_id(envelope.correlation_id.to_string().into())
                    .with_headers(headers_for(envelope))
                    .with_delivery_mode(2), // persistent
            )
            .await
            .context("amqp publish failed")?;

        confirm.await.context("amqp publish confirm failed")?;
        Ok(())
    }

    async fn subscribe(&self, patterns: &[&str]) -> Result<BusSubscription> {
        let channel = self
            .conn
            .create_channel()
            .await
            .context("amqp consumer channel open failed")?;

        // Server-named, auto-deleted queue per subscriber; each node gets
        // its own copy of every matching event.
        let mut queue_args = FieldTable::default();
        queue_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
        );
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                queue_args,
            )
            .await
            .context("amqp queue declare failed")?;

        for pattern in patterns {
            channel
                .queue_bind(
                    queue.name().as_str(),
                    EVENT_EXCHANGE,
                    pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .with_context(|| format!("amqp queue bind failed: {pattern}"))?;
        }

        let mut consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "vf-bus-subscriber",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("amqp consume failed")?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        error!(error = %e, "amqp consumer error");
                        break;
                    }
                };

                match serde_json::from_slice::<EventEnvelope>(&delivery.data) {
                    Ok(env) => {
                        if tx.send(env).await.is_err() {
                            break; // subscriber dropped
                        }
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            warn!(error = %e, "amqp ack failed");
                        }
                    }
                    Err(e) => {
                        // Undecodable payloads are acked away; they would
                        // otherwise redeliver forever.
                        warn!(error = %e, "dropping undecodable bus message");
                        let _ = delivery.ack(BasicAckOptions::default()).await;
                    }
                }
            }
        });

        Ok(BusSubscription { rx })
    }
}

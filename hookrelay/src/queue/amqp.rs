//! AMQP (RabbitMQ) backend.
//!
//! The backend keeps one persistent connection and channel, reconnecting on
//! demand. Delivery tags are channel-scoped, so a delete or release issued
//! after a reconnect fails; the broker has already requeued that delivery
//! when the old channel closed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    message::BasicGetMessage,
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use super::{generate_message_id, MessageQueue, ReceiveOptions, ReceivedMessage, MAX_BATCH};
use crate::error::QueueError;

/// How often an empty queue is re-checked while a receive is waiting.
const GET_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Header quorum queues use to report redeliveries.
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// RabbitMQ queue with connection management.
#[derive(Clone)]
pub struct AmqpQueue {
    inner: Arc<AmqpInner>,
}

struct AmqpInner {
    url: String,
    queue_name: String,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl AmqpQueue {
    /// Create a queue handle. No connection is made until first use.
    pub fn new(url: String, queue_name: String) -> Self {
        Self {
            inner: Arc::new(AmqpInner {
                url,
                queue_name,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    /// Connect eagerly so a bad broker URL fails at startup.
    pub async fn connect(&self) -> Result<(), QueueError> {
        self.ensure_connected().await.map(|_| ())
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<Channel, QueueError> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("amqp_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let ch = conn
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        ch.queue_declare(
            &self.inner.queue_name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))?;

        info!(queue = %self.inner.queue_name, "amqp_queue_declared");

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }
}

fn parse_delivery_tag(receipt: &str) -> Result<u64, QueueError> {
    receipt
        .parse()
        .map_err(|_| QueueError::Delete(format!("invalid delivery tag {receipt}")))
}

fn delivery_count(properties: &BasicProperties) -> Option<u32> {
    let headers = properties.headers().as_ref()?;
    let (_, value) = headers
        .inner()
        .iter()
        .find(|(name, _)| name.as_str() == DELIVERY_COUNT_HEADER)?;
    let count = match value {
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok()?,
        AMQPValue::LongInt(n) => u32::try_from(*n).ok()?,
        AMQPValue::LongUInt(n) => *n,
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok()?,
        _ => return None,
    };
    // Brokers count prior redeliveries; the first delivery reports zero.
    Some(count + 1)
}

fn to_received(message: BasicGetMessage) -> ReceivedMessage {
    let delivery = message.delivery;
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    ReceivedMessage {
        message_id,
        receipt: delivery.delivery_tag.to_string(),
        receive_count: delivery_count(&delivery.properties),
        body: delivery.data,
    }
}

#[async_trait]
impl MessageQueue for AmqpQueue {
    async fn send(&self, body: Vec<u8>) -> Result<String, QueueError> {
        let channel = self.ensure_connected().await?;
        let message_id = generate_message_id();

        channel
            .basic_publish(
                "",
                &self.inner.queue_name,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(message_id.clone().into()),
            )
            .await
            .map_err(|e| QueueError::Send(e.to_string()))?
            .await
            .map_err(|e| QueueError::Send(e.to_string()))?;

        info!(
            queue = %self.inner.queue_name,
            message_id = %message_id,
            body_length = body.len(),
            "amqp_published"
        );

        Ok(message_id)
    }

    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<ReceivedMessage>, QueueError> {
        let channel = self.ensure_connected().await?;
        let max = options.max_messages.clamp(1, MAX_BATCH);
        let deadline = Instant::now() + options.wait;
        let mut batch = Vec::new();

        loop {
            let message = channel
                .basic_get(&self.inner.queue_name, BasicGetOptions::default())
                .await
                .map_err(|e| QueueError::Receive(e.to_string()))?;

            match message {
                Some(message) => {
                    batch.push(to_received(message));
                    if batch.len() >= max {
                        break;
                    }
                }
                None if !batch.is_empty() => break,
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    sleep(GET_POLL_INTERVAL.min(deadline - now)).await;
                }
            }
        }

        Ok(batch)
    }

    async fn delete(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        let channel = self.ensure_connected().await?;
        let tag = parse_delivery_tag(&message.receipt)?;
        channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Delete(e.to_string()))
    }

    /// AMQP has no lease timeout, so an abandoned delivery is handed back
    /// explicitly.
    async fn release(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        let channel = self.ensure_connected().await?;
        let tag = parse_delivery_tag(&message.receipt)
            .map_err(|e| QueueError::Release(e.to_string()))?;
        channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Release(e.to_string()))
    }

    /// Close the connection gracefully.
    async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "amqp_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "amqp_connection_close_error");
            }
        }

        info!("amqp_closed");
    }
}

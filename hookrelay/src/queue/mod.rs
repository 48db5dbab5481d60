//! Durable queue between the ingress server and the delivery pump.
//!
//! This module provides:
//! - The [`Envelope`] message format
//! - The [`MessageQueue`] trait the two halves talk through
//! - Backends for AWS SQS, AMQP (RabbitMQ) and an in-process queue
//!
//! ## Architecture
//!
//! ```text
//! GitHub → Ingress → queue → Delivery Pump → CI endpoint
//! ```
//!
//! Delivery is at-least-once. A received message stays leased to one
//! consumer until it is deleted or its visibility timeout expires, after
//! which the provider hands it out again.

pub mod amqp;
pub mod envelope;
pub mod memory;
pub mod sqs;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{QueueBackend, QueueConfig};
use crate::error::QueueError;

pub use amqp::AmqpQueue;
pub use envelope::{Envelope, Headers, EVENT_HEADER};
pub use memory::MemoryQueue;
pub use sqs::SqsQueue;

/// Largest batch a single receive may return.
pub const MAX_BATCH: usize = 10;

/// Longest long-poll wait a single receive may block for.
pub const MAX_WAIT: Duration = Duration::from_secs(20);

/// Random 128-bit hex id for backends that do not assign their own.
pub(crate) fn generate_message_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// A message leased from the queue.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Provider-assigned message id.
    pub message_id: String,
    /// Lease handle used to delete or release this delivery.
    pub receipt: String,
    /// Serialized envelope.
    pub body: Vec<u8>,
    /// How many times the provider has handed this message out, if known.
    pub receive_count: Option<u32>,
}

/// Receive parameters for one poll.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveOptions {
    pub max_messages: usize,
    pub wait: Duration,
    pub visibility_timeout: Option<Duration>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: MAX_BATCH,
            wait: MAX_WAIT,
            visibility_timeout: None,
        }
    }
}

/// The at-least-once queue contract the relay depends on.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Durably enqueue a body, returning the provider's message id.
    async fn send(&self, body: Vec<u8>) -> Result<String, QueueError>;

    /// Long-poll for up to `options.max_messages` messages.
    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Acknowledge a message so it is never redelivered.
    async fn delete(&self, message: &ReceivedMessage) -> Result<(), QueueError>;

    /// Give up the lease on a message without acknowledging it.
    ///
    /// Providers with visibility timeouts redeliver on their own, so the
    /// default does nothing.
    async fn release(&self, _message: &ReceivedMessage) -> Result<(), QueueError> {
        Ok(())
    }

    /// Shut the connection down after the last send or delete.
    async fn close(&self) {}
}

/// Connect to the backend named in the configuration.
pub async fn connect(config: &QueueConfig) -> Result<Arc<dyn MessageQueue>, QueueError> {
    let queue: Arc<dyn MessageQueue> = match &config.backend {
        QueueBackend::Sqs {
            queue_name,
            region,
            endpoint_url,
        } => Arc::new(SqsQueue::connect(queue_name, region, endpoint_url.as_deref()).await?),
        QueueBackend::Amqp { url, queue_name } => {
            let queue = AmqpQueue::new(url.clone(), queue_name.clone());
            queue.connect().await?;
            Arc::new(queue)
        }
    };
    Ok(queue)
}

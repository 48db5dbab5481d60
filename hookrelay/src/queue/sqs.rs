//! AWS SQS backend.
//!
//! The queue URL is resolved once from the queue name at startup. Redelivery
//! is entirely SQS's job: a message that is not deleted before its
//! visibility timeout expires becomes receivable again.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::MessageSystemAttributeName;
use aws_sdk_sqs::Client;
use tracing::{info, warn};

use super::{MessageQueue, ReceiveOptions, ReceivedMessage, MAX_BATCH, MAX_WAIT};
use crate::error::QueueError;

#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    /// Build a client for `region` (and an optional endpoint override) and
    /// resolve the URL of `queue_name`.
    pub async fn connect(
        queue_name: &str,
        region: &str,
        endpoint_url: Option<&str>,
    ) -> Result<Self, QueueError> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        let client = Client::new(&sdk_config);

        info!(queue = %queue_name, region = %region, "sqs_resolving_queue");

        let output = client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| QueueError::Connection(DisplayErrorContext(&e).to_string()))?;
        let queue_url = output
            .queue_url()
            .ok_or(QueueError::Incomplete("queue url"))?
            .to_string();

        info!(queue_url = %queue_url, "sqs_queue_resolved");

        Ok(Self { client, queue_url })
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn send(&self, body: Vec<u8>) -> Result<String, QueueError> {
        // SQS bodies are text; envelopes are always UTF-8 JSON.
        let body = String::from_utf8(body).map_err(|e| QueueError::Send(e.to_string()))?;

        let output = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| QueueError::Send(DisplayErrorContext(&e).to_string()))?;

        output
            .message_id()
            .map(str::to_string)
            .ok_or(QueueError::Incomplete("message id"))
    }

    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<ReceivedMessage>, QueueError> {
        let max_messages = options.max_messages.clamp(1, MAX_BATCH) as i32;
        let wait_seconds = options.wait.min(MAX_WAIT).as_secs() as i32;
        let visibility = options
            .visibility_timeout
            .map(|timeout| timeout.as_secs().min(i32::MAX as u64) as i32);

        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_seconds)
            .set_visibility_timeout(visibility)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| QueueError::Receive(DisplayErrorContext(&e).to_string()))?;

        let mut batch = Vec::new();
        for message in output.messages() {
            let (Some(message_id), Some(receipt)) = (message.message_id(), message.receipt_handle())
            else {
                warn!("sqs_message_missing_identifiers");
                continue;
            };

            let receive_count = message
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|count| count.parse().ok());

            batch.push(ReceivedMessage {
                message_id: message_id.to_string(),
                receipt: receipt.to_string(),
                body: message.body().unwrap_or_default().as_bytes().to_vec(),
                receive_count,
            });
        }

        Ok(batch)
    }

    async fn delete(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&message.receipt)
            .send()
            .await
            .map_err(|e| QueueError::Delete(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }
}

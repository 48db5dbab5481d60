//! Delivery pump: drains the queue into the CI endpoint.
//!
//! Each received message moves through
//!
//! ```text
//! Received → Forwarding → Acknowledged | Abandoned
//! ```
//!
//! plus two side exits: `Malformed` (the body is not a usable envelope) and
//! `Discarded` (the message exceeded the configured receive count).
//!
//! A message is deleted only after the CI endpoint answered. Anything else
//! leaves it in the queue, and the provider redelivers it once its
//! visibility timeout runs out. The pump never retries a POST itself.

pub mod forwarder;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use reqwest::StatusCode;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::PumpConfig;
use crate::error::{CycleError, EnvelopeError, ForwardError, QueueError};
use crate::queue::{Envelope, MessageQueue, ReceiveOptions, ReceivedMessage};

pub use forwarder::{project_headers, Forwarder};

/// Longest slice of a bad message body copied into logs.
const BODY_PREVIEW_BYTES: usize = 500;

/// Terminal state of one received message.
#[derive(Debug)]
pub enum Delivery {
    /// Forwarded and deleted.
    Acknowledged(StatusCode),
    /// Forwarded, but the delete failed; the message will come back.
    AckFailed(QueueError),
    /// Forward failed; left in the queue for redelivery.
    Abandoned(ForwardError),
    /// Body is not a forwardable envelope; left in the queue.
    Malformed(EnvelopeError),
    /// Received more often than allowed; deleted without forwarding.
    Discarded { receive_count: u32 },
}

/// Per-state counts for one poll cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub received: usize,
    pub acknowledged: usize,
    pub ack_failed: usize,
    pub abandoned: usize,
    pub malformed: usize,
    pub discarded: usize,
}

impl CycleReport {
    fn record(&mut self, delivery: &Delivery) {
        match delivery {
            Delivery::Acknowledged(_) => self.acknowledged += 1,
            Delivery::AckFailed(_) => self.ack_failed += 1,
            Delivery::Abandoned(_) => self.abandoned += 1,
            Delivery::Malformed(_) => self.malformed += 1,
            Delivery::Discarded { .. } => self.discarded += 1,
        }
    }
}

/// Loop timing and poison-message policy.
#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    pub receive: ReceiveOptions,
    pub poll_interval: Duration,
    pub max_receive_count: Option<u32>,
}

impl PumpSettings {
    pub fn from_config(config: &PumpConfig) -> Self {
        Self {
            receive: config.receive_options(),
            poll_interval: config.poll_interval,
            max_receive_count: config.max_receive_count,
        }
    }
}

/// One polling consumer. Clones share the queue handle and HTTP client.
#[derive(Clone)]
pub struct Pump {
    queue: Arc<dyn MessageQueue>,
    forwarder: Forwarder,
    settings: PumpSettings,
    instance: usize,
}

impl Pump {
    pub fn new(queue: Arc<dyn MessageQueue>, forwarder: Forwarder, settings: PumpSettings) -> Self {
        Self {
            queue,
            forwarder,
            settings,
            instance: 0,
        }
    }

    /// Label used in this pump's log events.
    pub fn with_instance(mut self, instance: usize) -> Self {
        self.instance = instance;
        self
    }

    /// Poll once and drive every received message to a terminal state.
    pub async fn run_cycle(&self) -> Result<CycleReport, QueueError> {
        let messages = self.queue.receive(self.settings.receive).await?;

        let mut report = CycleReport {
            received: messages.len(),
            ..CycleReport::default()
        };

        for message in &messages {
            let delivery = self.process_message(message).await;
            report.record(&delivery);
        }

        Ok(report)
    }

    /// Handle one message. Never fails; the outcome is the return value.
    pub async fn process_message(&self, message: &ReceivedMessage) -> Delivery {
        info!(
            instance = self.instance,
            message_id = %message.message_id,
            receive_count = ?message.receive_count,
            body_length = message.body.len(),
            "pump_message_received"
        );

        if let (Some(limit), Some(count)) = (self.settings.max_receive_count, message.receive_count) {
            if count > limit {
                return self.discard(message, count).await;
            }
        }

        let envelope = match Envelope::from_slice(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => return self.malformed(message, e).await,
        };

        let headers = match project_headers(&envelope) {
            Ok(headers) => headers,
            Err(e) => return self.malformed(message, e).await,
        };

        match self.forwarder.post(headers, envelope.payload()).await {
            Ok(status) => match self.queue.delete(message).await {
                Ok(()) => {
                    info!(
                        instance = self.instance,
                        message_id = %message.message_id,
                        status_code = status.as_u16(),
                        "pump_message_acknowledged"
                    );
                    Delivery::Acknowledged(status)
                }
                Err(e) => {
                    error!(
                        instance = self.instance,
                        message_id = %message.message_id,
                        error = %e,
                        "pump_message_delete_failed"
                    );
                    Delivery::AckFailed(e)
                }
            },
            Err(e) => {
                warn!(
                    instance = self.instance,
                    message_id = %message.message_id,
                    endpoint = %self.forwarder.endpoint(),
                    error = %e,
                    "pump_message_abandoned"
                );
                self.release(message).await;
                Delivery::Abandoned(e)
            }
        }
    }

    async fn malformed(&self, message: &ReceivedMessage, e: EnvelopeError) -> Delivery {
        error!(
            instance = self.instance,
            message_id = %message.message_id,
            error = %e,
            body_preview = %preview(&message.body),
            "pump_message_malformed"
        );
        self.release(message).await;
        Delivery::Malformed(e)
    }

    async fn discard(&self, message: &ReceivedMessage, receive_count: u32) -> Delivery {
        error!(
            instance = self.instance,
            message_id = %message.message_id,
            receive_count = receive_count,
            max_receive_count = ?self.settings.max_receive_count,
            body_preview = %preview(&message.body),
            "pump_message_discarded"
        );
        match self.queue.delete(message).await {
            Ok(()) => Delivery::Discarded { receive_count },
            Err(e) => {
                error!(
                    instance = self.instance,
                    message_id = %message.message_id,
                    error = %e,
                    "pump_message_delete_failed"
                );
                Delivery::AckFailed(e)
            }
        }
    }

    async fn release(&self, message: &ReceivedMessage) {
        if let Err(e) = self.queue.release(message).await {
            warn!(
                instance = self.instance,
                message_id = %message.message_id,
                error = %e,
                "pump_message_release_failed"
            );
        }
    }

    /// Run one cycle, turning a panic anywhere inside it into an error.
    pub async fn guarded_cycle(&self) -> Result<CycleReport, CycleError> {
        match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
            Ok(result) => Ok(result?),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(CycleError::Panicked(reason))
            }
        }
    }

    fn log_cycle(&self, result: &Result<CycleReport, CycleError>) {
        match result {
            Ok(report) if report.received == 0 => {
                debug!(instance = self.instance, "pump_cycle_idle");
            }
            Ok(report) => {
                info!(
                    instance = self.instance,
                    received = report.received,
                    acknowledged = report.acknowledged,
                    ack_failed = report.ack_failed,
                    abandoned = report.abandoned,
                    malformed = report.malformed,
                    discarded = report.discarded,
                    "pump_cycle_complete"
                );
            }
            Err(e) => {
                error!(instance = self.instance, error = %e, "pump_cycle_failed");
            }
        }
    }

    /// Poll, forward, sleep, repeat, until `shutdown` resolves.
    ///
    /// A failed cycle is logged and followed by the same sleep as a
    /// successful one. Shutdown is only observed between cycles, so an
    /// in-flight forward always finishes with its delete.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(
            instance = self.instance,
            endpoint = %self.forwarder.endpoint(),
            poll_interval_secs = self.settings.poll_interval.as_secs_f64(),
            "pump_started"
        );

        loop {
            let result = self.guarded_cycle().await;
            self.log_cycle(&result);

            tokio::select! {
                _ = &mut shutdown => {
                    info!(instance = self.instance, "pump_stopping");
                    break;
                }
                _ = sleep(self.settings.poll_interval) => {}
            }
        }
    }

    /// Poll forever.
    pub async fn run(&self) {
        self.run_until(std::future::pending::<()>()).await
    }
}

fn preview(body: &[u8]) -> String {
    String::from_utf8_lossy(&body[..body.len().min(BODY_PREVIEW_BYTES)]).into_owned()
}

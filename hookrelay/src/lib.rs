//! hookrelay - queue-backed relay from GitHub webhooks to a CI server.
//!
//! This library provides shared modules for the two hookrelay binaries:
//! - `hookrelay-web`: verifies GitHub webhook signatures and enqueues envelopes
//! - `hookrelay-pump`: drains the queue and POSTs each payload to CI
//!
//! ## Architecture
//!
//! ```text
//! GitHub → hookrelay-web → queue (SQS / AMQP) → hookrelay-pump → CI endpoint
//! ```
//!
//! Delivery is at-least-once. CI downtime leaves messages in the queue
//! instead of failing deliveries back to GitHub.

pub mod config;
pub mod error;
pub mod pump;
pub mod queue;
pub mod web;

// Re-export commonly used types
pub use config::{IngressConfig, PumpConfig, QueueConfig};
pub use error::{
    ConfigError, CycleError, EnvelopeError, ForwardError, IngressError, QueueError, SignatureError,
};
pub use pump::{CycleReport, Delivery, Forwarder, Pump, PumpSettings};
pub use queue::{Envelope, Headers, MemoryQueue, MessageQueue, ReceivedMessage};
pub use web::AppState;

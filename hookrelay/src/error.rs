//! Error types shared across the relay.
//!
//! Each stage of the pipeline has its own error enum so the pump can tell a
//! malformed message from a transport fault without string matching.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

/// Startup configuration failure. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Webhook signature verification failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// No signature header, or one without a supported `algo=` prefix.
    #[error("X-Hub-Signature required")]
    Missing,

    /// The digest is not hex or does not match the body.
    #[error("Invalid signature")]
    Invalid,
}

/// Failure on the inbound webhook path.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("payload field required")]
    MissingPayload,

    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    #[error("unsupported content type")]
    UnsupportedContentType,

    #[error("failed to serialize envelope: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error(transparent)]
    Enqueue(#[from] QueueError),
}

impl IngressError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Signature(_)
            | Self::MissingPayload
            | Self::InvalidPayload(_)
            | Self::UnsupportedContentType => StatusCode::BAD_REQUEST,
            Self::Serialize(_) | Self::Enqueue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Serialize(err) => {
                error!(error = %err, "webhook_envelope_serialize_failed");
                "Failed to enqueue webhook".to_string()
            }
            Self::Enqueue(err) => {
                error!(error = %err, "webhook_enqueue_failed");
                "Failed to enqueue webhook".to_string()
            }
            other => {
                warn!(error = %other, "webhook_rejected");
                other.to_string()
            }
        };

        (status, body).into_response()
    }
}

/// Queue provider failure, from any backend.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection failed: {0}")]
    Connection(String),

    #[error("queue send failed: {0}")]
    Send(String),

    #[error("queue receive failed: {0}")]
    Receive(String),

    #[error("queue delete failed: {0}")]
    Delete(String),

    #[error("queue release failed: {0}")]
    Release(String),

    #[error("queue response missing {0}")]
    Incomplete(&'static str),
}

/// A dequeued body that cannot be turned into a forwardable request.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("envelope has no {0} header")]
    MissingHeader(&'static str),

    #[error("header {name} has an invalid value")]
    InvalidHeader { name: &'static str },
}

/// Failure forwarding a payload to the CI endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("request to CI endpoint timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error talking to CI endpoint: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("CI endpoint answered {0}")]
    Rejected(reqwest::StatusCode),

    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Why a whole poll cycle failed. Never stops the pump.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("poll cycle panicked: {0}")]
    Panicked(String),
}

//! Webhook endpoint handlers.
//!
//! The ingress path does as little as possible before answering GitHub:
//! 1. Verify the signature over the raw body
//! 2. Extract the `payload` field
//! 3. Enqueue the envelope and return the queue's message id
//!
//! Forwarding to CI happens later, in the delivery pump.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::config::IngressConfig;
use crate::error::IngressError;
use crate::queue::{Envelope, Headers, MessageQueue, EVENT_HEADER};
use crate::web::signature::{signature_from_headers, verify_signature};

/// Header GitHub sets to a unique id per delivery.
pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<IngressConfig>,
    pub queue: Arc<dyn MessageQueue>,
}

impl AppState {
    pub fn new(config: IngressConfig, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            config: Arc::new(config),
            queue,
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// GitHub Webhook
// =============================================================================

/// Authenticate a delivery and build its envelope.
///
/// `body` must be the request body exactly as received: the signature is
/// computed over those bytes, before any form or JSON parsing.
pub fn accept(secret: &[u8], headers: &HeaderMap, body: &[u8]) -> Result<Envelope, IngressError> {
    let signature = signature_from_headers(headers)?;
    verify_signature(secret, body, &signature)?;

    let payload = extract_payload(headers, body)?;
    Ok(Envelope::new(Headers::from_header_map(headers), payload))
}

/// Serialize and durably enqueue an envelope, returning the message id.
///
/// Not idempotent: a retried call enqueues a second copy.
pub async fn enqueue(queue: &dyn MessageQueue, envelope: &Envelope) -> Result<String, IngressError> {
    let body = envelope.to_vec().map_err(IngressError::Serialize)?;
    Ok(queue.send(body).await?)
}

/// Pull the webhook payload out of a form or JSON body.
fn extract_payload(headers: &HeaderMap, body: &[u8]) -> Result<Value, IngressError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();

    if content_type == "application/x-www-form-urlencoded" {
        let field = url::form_urlencoded::parse(body)
            .find(|(name, _)| name == "payload")
            .map(|(_, value)| value)
            .ok_or(IngressError::MissingPayload)?;
        return serde_json::from_str(&field).map_err(IngressError::InvalidPayload);
    }

    if content_type == "application/json" || content_type.ends_with("+json") {
        let document: Value = serde_json::from_slice(body).map_err(IngressError::InvalidPayload)?;
        return match document {
            Value::Object(mut fields) if fields.contains_key("payload") => {
                match fields.remove("payload").unwrap_or(Value::Null) {
                    Value::String(raw) => {
                        serde_json::from_str(&raw).map_err(IngressError::InvalidPayload)
                    }
                    value => Ok(value),
                }
            }
            // GitHub's `application/json` deliveries send the payload as the body.
            document => Ok(document),
        };
    }

    Err(IngressError::UnsupportedContentType)
}

/// GitHub webhook endpoint.
///
/// Responds `200 OK (ID: <message-id>)` once the envelope is enqueued,
/// `400` for authentication or payload errors and `500` when the queue
/// rejects the send.
pub async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<String, IngressError> {
    let event = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let delivery = headers
        .get(DELIVERY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    info!(
        event = %event,
        delivery = %delivery,
        body_length = body.len(),
        "webhook_received"
    );

    let envelope = accept(state.config.secret.expose(), &headers, &body)?;
    let message_id = enqueue(state.queue.as_ref(), &envelope).await?;

    info!(
        event = %event,
        delivery = %delivery,
        message_id = %message_id,
        "webhook_enqueued"
    );

    Ok(format!("OK (ID: {message_id})"))
}

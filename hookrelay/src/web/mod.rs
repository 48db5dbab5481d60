//! Web server module for receiving GitHub webhooks.
//!
//! This module provides a thin web server that:
//! - Verifies the webhook signature over the raw body
//! - Immediately enqueues an envelope to the durable queue
//! - Returns the queue's message id
//!
//! Forwarding to CI happens in the delivery pump.

pub mod handlers;
pub mod signature;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{accept, enqueue, github_webhook, health, AppState, HealthResponse};
pub use signature::{sign, signature_from_headers, verify_signature, Algorithm, Signature};

/// GitHub caps webhook payloads at 25 MB.
const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Build the ingress router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/github-webhook", post(github_webhook))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

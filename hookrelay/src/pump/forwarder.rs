//! Outbound POST to the CI endpoint.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{info, warn};
use url::Url;

use crate::config::PumpConfig;
use crate::error::{EnvelopeError, ForwardError};
use crate::queue::{Envelope, EVENT_HEADER};

/// Longest slice of a CI response body copied into logs.
const RESPONSE_PREVIEW_BYTES: usize = 500;

/// Build the headers sent to CI: JSON content type plus the inbound event
/// type. Nothing else from the inbound request is forwarded.
pub fn project_headers(envelope: &Envelope) -> Result<HeaderMap, EnvelopeError> {
    let event = envelope.event_type()?;
    let event = HeaderValue::from_str(event)
        .map_err(|_| EnvelopeError::InvalidHeader { name: EVENT_HEADER })?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(HeaderName::from_static("x-github-event"), event);
    Ok(headers)
}

/// Posts payloads to one CI endpoint over a shared HTTP client.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: Client,
    endpoint: Url,
    timeout: Duration,
    retain_on_http_error: bool,
}

impl Forwarder {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        Self::with_client_options(endpoint, timeout, false)
    }

    pub fn from_config(config: &PumpConfig) -> Result<Self, reqwest::Error> {
        let mut forwarder = Self::with_client_options(
            config.ci_endpoint.clone(),
            config.forward_timeout,
            config.accept_invalid_certs,
        )?;
        forwarder.retain_on_http_error = config.retain_on_http_error;
        Ok(forwarder)
    }

    fn with_client_options(
        endpoint: Url,
        timeout: Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            timeout,
            retain_on_http_error: false,
        })
    }

    /// Treat non-2xx responses as failed forwards.
    pub fn retain_on_http_error(mut self, retain: bool) -> Self {
        self.retain_on_http_error = retain;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// POST `payload` as JSON.
    ///
    /// Any HTTP response counts as delivered unless `retain_on_http_error`
    /// is set; timeouts and transport failures never do.
    pub async fn post(&self, headers: HeaderMap, payload: &Value) -> Result<StatusCode, ForwardError> {
        let body = serde_json::to_vec(payload)?;

        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ForwardError::Timeout(self.timeout)
                } else {
                    ForwardError::Transport(e)
                }
            })?;

        let status = response.status();
        let preview = match read_preview(response, RESPONSE_PREVIEW_BYTES).await {
            Ok(preview) => preview,
            Err(e) => {
                warn!(status_code = status.as_u16(), error = %e, "ci_response_body_unreadable");
                String::new()
            }
        };

        if status.is_success() {
            info!(
                status_code = status.as_u16(),
                response_preview = %preview,
                "ci_forward_complete"
            );
            return Ok(status);
        }

        warn!(
            status_code = status.as_u16(),
            response_preview = %preview,
            retained = self.retain_on_http_error,
            "ci_forward_non_success"
        );

        if self.retain_on_http_error {
            Err(ForwardError::Rejected(status))
        } else {
            Ok(status)
        }
    }
}

/// Read at most `max` bytes of the response body. The rest is never
/// buffered.
async fn read_preview(mut response: Response, max: usize) -> Result<String, reqwest::Error> {
    let mut buf = Vec::new();
    while buf.len() < max {
        match response.chunk().await? {
            Some(chunk) => {
                let take = chunk.len().min(max - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            None => break,
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Headers;
    use serde_json::json;

    #[test]
    fn test_project_headers() {
        let mut headers = Headers::new();
        headers.insert("x-github-event", "pull_request");
        headers.insert("X-Hub-Signature", "sha1=abc");
        headers.insert("User-Agent", "GitHub-Hookshot/abc");
        let envelope = Envelope::new(headers, json!({}));

        let projected = project_headers(&envelope).unwrap();

        assert_eq!(projected.len(), 2);
        assert_eq!(projected[CONTENT_TYPE], "application/json");
        assert_eq!(projected["X-Github-Event"], "pull_request");
    }

    #[test]
    fn test_project_headers_requires_event() {
        let envelope = Envelope::new(Headers::new(), json!({}));
        assert!(matches!(
            project_headers(&envelope),
            Err(EnvelopeError::MissingHeader(_))
        ));
    }

    #[test]
    fn test_project_headers_rejects_control_characters() {
        let mut headers = Headers::new();
        headers.insert(EVENT_HEADER, "push\nX-Injected: 1");
        let envelope = Envelope::new(headers, json!({}));
        assert!(matches!(
            project_headers(&envelope),
            Err(EnvelopeError::InvalidHeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_preview_stops_at_limit() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let ci = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(64 * 1024)))
            .mount(&ci)
            .await;

        let response = reqwest::get(ci.uri()).await.unwrap();
        let preview = read_preview(response, RESPONSE_PREVIEW_BYTES).await.unwrap();
        assert_eq!(preview.len(), RESPONSE_PREVIEW_BYTES);

        let response = reqwest::get(ci.uri()).await.unwrap();
        assert_eq!(read_preview(response, 1 << 20).await.unwrap().len(), 64 * 1024);
    }
}

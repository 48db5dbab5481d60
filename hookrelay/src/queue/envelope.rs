//! The envelope carried through the queue.
//!
//! Wire format of a queue message body:
//!
//! ```text
//! {"headers": {"X-Github-Event": "push", ...}, "payload": {...}}
//! ```
//!
//! Header names are stored in the `Title-Case` form GitHub documents, and
//! lookups ignore case.

use std::collections::BTreeMap;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EnvelopeError;

/// Header carrying the GitHub event type (`push`, `pull_request`, ...).
pub const EVENT_HEADER: &str = "X-Github-Event";

/// Request headers captured at ingress, with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture every header with a UTF-8 value. Repeated headers are joined
    /// with `", "`.
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut headers = Headers::new();
        for name in map.keys() {
            let values: Vec<&str> = map
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            if values.is_empty() {
                continue;
            }
            headers.insert(title_case(name.as_str()), values.join(", "));
        }
        headers
    }

    /// Insert a header, replacing any existing entry whose name differs only
    /// in case.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
        self.0.insert(name, value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// `x-github-event` -> `X-Github-Event`
fn title_case(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Unit of work moved from the ingress server to the delivery pump.
///
/// There are no mutating accessors: once built, an envelope is only
/// serialized, parsed back, and projected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    headers: Headers,
    payload: Value,
}

impl Envelope {
    pub fn new(headers: Headers, payload: Value) -> Self {
        Self { headers, payload }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Value of the event-type header, required for forwarding.
    pub fn event_type(&self) -> Result<&str, EnvelopeError> {
        self.headers
            .get(EVENT_HEADER)
            .ok_or(EnvelopeError::MissingHeader(EVENT_HEADER))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("x-github-event"), "X-Github-Event");
        assert_eq!(title_case("content-type"), "Content-Type");
        assert_eq!(title_case("X-HUB-SIGNATURE-256"), "X-Hub-Signature-256");
    }

    #[test]
    fn test_headers_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.insert("X-Github-Event", "push");

        assert_eq!(headers.get("x-github-event"), Some("push"));
        assert_eq!(headers.get("X-GITHUB-EVENT"), Some("push"));
        assert_eq!(headers.get("X-Github-Delivery"), None);
    }

    #[test]
    fn test_headers_insert_replaces_other_case() {
        let mut headers = Headers::new();
        headers.insert("x-github-event", "push");
        headers.insert("X-Github-Event", "ping");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("X-Github-Event"), Some("ping"));
    }

    #[test]
    fn test_headers_from_header_map() {
        let mut map = HeaderMap::new();
        map.insert("x-github-event", HeaderValue::from_static("push"));
        map.append("accept", HeaderValue::from_static("text/plain"));
        map.append("accept", HeaderValue::from_static("application/json"));
        map.insert("x-binary", HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap());

        let headers = Headers::from_header_map(&map);

        assert_eq!(headers.get("X-Github-Event"), Some("push"));
        assert_eq!(headers.get("Accept"), Some("text/plain, application/json"));
        assert_eq!(headers.get("X-Binary"), None);
        assert!(headers.iter().any(|(k, _)| k == "X-Github-Event"));
    }

    #[test]
    fn test_envelope_wire_format() {
        let mut headers = Headers::new();
        headers.insert("X-Github-Event", "push");
        let envelope = Envelope::new(headers, json!({"ref": "refs/heads/main"}));

        let value: Value = serde_json::from_slice(&envelope.to_vec().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "headers": {"X-Github-Event": "push"},
                "payload": {"ref": "refs/heads/main"}
            })
        );
    }

    #[test]
    fn test_envelope_from_foreign_producer() {
        // Bodies written by other producers may use any header case.
        let body = br#"{"headers":{"x-github-event":"pull_request"},"payload":{"number":7}}"#;
        let envelope = Envelope::from_slice(body).unwrap();

        assert_eq!(envelope.event_type().unwrap(), "pull_request");
        assert_eq!(envelope.payload()["number"], 7);
    }

    #[test]
    fn test_envelope_missing_event_header() {
        let envelope = Envelope::from_slice(br#"{"headers":{},"payload":{}}"#).unwrap();
        assert!(matches!(
            envelope.event_type(),
            Err(EnvelopeError::MissingHeader(EVENT_HEADER))
        ));
    }

    #[test]
    fn test_envelope_rejects_invalid_json() {
        assert!(matches!(
            Envelope::from_slice(b"not json"),
            Err(EnvelopeError::Parse(_))
        ));
        assert!(matches!(
            Envelope::from_slice(br#"{"payload":{}}"#),
            Err(EnvelopeError::Parse(_))
        ));
    }
}

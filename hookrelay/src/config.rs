//! Configuration module for environment variable parsing.
//!
//! Each binary builds its configuration once at startup and passes it down.
//! Every loader is written against a lookup function so tests can supply
//! values without touching the process environment.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;
use crate::queue::{ReceiveOptions, MAX_BATCH, MAX_WAIT};

/// Source of configuration values by variable name.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn process_env(name: &str) -> Option<String> {
    env::var(name).ok()
}

/// Which queue provider carries envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueBackend {
    Sqs {
        queue_name: String,
        region: String,
        /// Endpoint override, for local SQS emulators.
        endpoint_url: Option<String>,
    },
    Amqp {
        url: String,
        queue_name: String,
    },
}

/// Queue settings shared by the ingress server and the pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub backend: QueueBackend,
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let backend = optional(lookup, "QUEUE_BACKEND").unwrap_or_else(|| "sqs".to_string());

        let backend = match backend.to_ascii_lowercase().as_str() {
            "sqs" => QueueBackend::Sqs {
                queue_name: required(lookup, "SQS_QUEUE")?,
                region: required(lookup, "SQS_REGION")?,
                endpoint_url: optional(lookup, "SQS_ENDPOINT_URL"),
            },
            "amqp" => QueueBackend::Amqp {
                url: required(lookup, "CLOUDAMQP_URL")?,
                queue_name: optional(lookup, "AMQP_QUEUE")
                    .unwrap_or_else(|| "github_webhooks".to_string()),
            },
            other => {
                return Err(ConfigError::Invalid {
                    name: "QUEUE_BACKEND",
                    reason: format!("unknown backend {other:?}, expected sqs or amqp"),
                })
            }
        };

        Ok(Self { backend })
    }

    /// Short backend name for logs.
    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            QueueBackend::Sqs { .. } => "sqs",
            QueueBackend::Amqp { .. } => "amqp",
        }
    }
}

/// Shared webhook signing secret. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSecret(String);

impl SigningSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(<redacted>)")
    }
}

/// Settings for the ingress web server.
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Port for the web server to listen on
    pub port: u16,

    /// Secret shared with GitHub for HMAC signatures
    pub secret: SigningSecret,

    pub queue: QueueConfig,
}

impl IngressConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            port: parse_or(lookup, "PORT", 8080)?,
            secret: SigningSecret::new(required_raw(lookup, "GITHUB_SECRET")?),
            queue: QueueConfig::from_lookup(lookup)?,
        })
    }
}

/// Settings for the delivery pump.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// CI endpoint every payload is POSTed to
    pub ci_endpoint: Url,

    /// Fixed sleep after every poll cycle
    pub poll_interval: Duration,

    /// Long-poll wait per receive (at most 20s)
    pub receive_wait: Duration,

    /// Messages per receive (1 to 10)
    pub receive_max_messages: usize,

    /// Lease requested on receive; the queue's default when unset
    pub visibility_timeout: Option<Duration>,

    /// Timeout for the outbound POST
    pub forward_timeout: Duration,

    /// Drop messages received more often than this; unbounded when unset
    pub max_receive_count: Option<u32>,

    /// Keep messages the CI endpoint answers with a non-2xx status
    pub retain_on_http_error: bool,

    /// Skip TLS certificate verification toward the CI endpoint
    pub accept_invalid_certs: bool,

    /// Number of pump loops run concurrently
    pub instances: usize,

    pub queue: QueueConfig,
}

impl PumpConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let raw_endpoint = required(lookup, "JENKINS_URL")?;
        let ci_endpoint = Url::parse(&raw_endpoint).map_err(|e| ConfigError::Invalid {
            name: "JENKINS_URL",
            reason: e.to_string(),
        })?;
        if !matches!(ci_endpoint.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                name: "JENKINS_URL",
                reason: format!("unsupported scheme {}", ci_endpoint.scheme()),
            });
        }

        let receive_wait = Duration::from_secs(parse_or(lookup, "RECEIVE_WAIT_SECS", 20)?);
        let receive_max_messages: usize = parse_or(lookup, "RECEIVE_MAX_MESSAGES", MAX_BATCH)?;

        let instances: usize = parse_or(lookup, "PUMP_INSTANCES", 1)?;
        if instances == 0 {
            return Err(ConfigError::Invalid {
                name: "PUMP_INSTANCES",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            ci_endpoint,
            poll_interval: Duration::from_secs(parse_or(lookup, "POLL_INTERVAL_SECS", 5)?),
            receive_wait: receive_wait.min(MAX_WAIT),
            receive_max_messages: receive_max_messages.clamp(1, MAX_BATCH),
            visibility_timeout: parse_optional::<u64>(lookup, "VISIBILITY_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            forward_timeout: Duration::from_secs(parse_or(lookup, "FORWARD_TIMEOUT_SECS", 30)?),
            max_receive_count: parse_optional(lookup, "MAX_RECEIVE_COUNT")?,
            retain_on_http_error: parse_bool(lookup, "RETAIN_ON_HTTP_ERROR", false)?,
            accept_invalid_certs: parse_bool(lookup, "CI_ACCEPT_INVALID_CERTS", false)?,
            instances,
            queue: QueueConfig::from_lookup(lookup)?,
        })
    }

    pub fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: self.receive_max_messages,
            wait: self.receive_wait,
            visibility_timeout: self.visibility_timeout,
        }
    }
}

/// A set, non-blank value.
fn optional(lookup: Lookup<'_>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(lookup: Lookup<'_>, name: &'static str) -> Result<String, ConfigError> {
    optional(lookup, name).ok_or(ConfigError::Missing(name))
}

/// A set, non-blank value, kept byte-for-byte.
fn required_raw(lookup: Lookup<'_>, name: &'static str) -> Result<String, ConfigError> {
    lookup(name)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parse_optional<T>(lookup: Lookup<'_>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    optional(lookup, name)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                name,
                reason: format!("{raw:?}: {e}"),
            })
        })
        .transpose()
}

fn parse_or<T>(lookup: Lookup<'_>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    Ok(parse_optional(lookup, name)?.unwrap_or(default))
}

fn parse_bool(lookup: Lookup<'_>, name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(lookup, name) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                reason: format!("{raw:?} is not a boolean"),
            }),
        },
    }
}

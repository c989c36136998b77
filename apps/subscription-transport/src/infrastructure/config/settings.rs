//! Transport Configuration Settings
//!
//! Configuration types for the subscription transport, loaded from
//! environment variables. Every loader takes a lookup function so tests can
//! supply variables without touching the process environment.

use std::time::Duration;

use serde_json::Value;

use crate::domain::subscription::{GraphQLBody, SubscriptionOptions, WsSubProtocol};

/// Connection handler tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    /// Bound on waiting for `connection_ack` after `connection_init`.
    pub ack_timeout: Duration,
    /// Interval of the sweep removing subscribers whose scope ended.
    pub liveness_interval: Duration,
    /// Bound on handing one message or close signal to a subscriber.
    pub delivery_timeout: Duration,
    /// Capacity of a handler's inbound subscriber queue.
    pub join_queue_capacity: usize,
    /// Capacity of the queue between a read task and its event loop.
    pub read_queue_capacity: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            liveness_interval: Duration::from_secs(1),
            delivery_timeout: Duration::from_secs(5),
            join_queue_capacity: 16,
            read_queue_capacity: 64,
        }
    }
}

impl TransportSettings {
    /// Create settings from environment variables, defaulting anything
    /// missing or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create settings from an arbitrary variable source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            ack_timeout: parse_duration_millis(
                &lookup,
                "SUBSCRIPTION_ACK_TIMEOUT_MS",
                defaults.ack_timeout,
            ),
            liveness_interval: parse_duration_millis(
                &lookup,
                "SUBSCRIPTION_LIVENESS_INTERVAL_MS",
                defaults.liveness_interval,
            ),
            delivery_timeout: parse_duration_millis(
                &lookup,
                "SUBSCRIPTION_DELIVERY_TIMEOUT_MS",
                defaults.delivery_timeout,
            ),
            join_queue_capacity: parse_usize(
                &lookup,
                "SUBSCRIPTION_JOIN_QUEUE_CAPACITY",
                defaults.join_queue_capacity,
            ),
            read_queue_capacity: parse_usize(
                &lookup,
                "SUBSCRIPTION_READ_QUEUE_CAPACITY",
                defaults.read_queue_capacity,
            ),
        }
    }
}

/// Upstream subscription used by the demo binary.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Upstream URL.
    pub url: String,
    /// Subscription document.
    pub query: String,
    /// Operation variables.
    pub variables: Option<Value>,
    /// Operation name.
    pub operation_name: String,
    /// Use SSE instead of WebSocket.
    pub use_sse: bool,
    /// Use POST for SSE.
    pub sse_method_post: bool,
    /// WebSocket sub-protocol preference.
    pub ws_sub_protocol: WsSubProtocol,
}

impl UpstreamSettings {
    /// Create settings from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `UPSTREAM_URL` or `UPSTREAM_QUERY` is missing or
    /// empty, or if `UPSTREAM_VARIABLES` / `UPSTREAM_WS_SUBPROTOCOL` cannot
    /// be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create settings from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`UpstreamSettings::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = required(&lookup, "UPSTREAM_URL")?;
        let query = required(&lookup, "UPSTREAM_QUERY")?;

        let variables = match lookup("UPSTREAM_VARIABLES").filter(|v| !v.trim().is_empty()) {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|_| {
                ConfigError::InvalidValue {
                    key: "UPSTREAM_VARIABLES".to_string(),
                    value: raw.clone(),
                }
            })?),
            None => None,
        };

        let ws_sub_protocol = match lookup("UPSTREAM_WS_SUBPROTOCOL") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "UPSTREAM_WS_SUBPROTOCOL".to_string(),
                value: raw.clone(),
            })?,
            None => WsSubProtocol::Auto,
        };

        Ok(Self {
            url,
            query,
            variables,
            operation_name: lookup("UPSTREAM_OPERATION_NAME").unwrap_or_default(),
            use_sse: parse_bool(&lookup, "UPSTREAM_USE_SSE", false),
            sse_method_post: parse_bool(&lookup, "UPSTREAM_SSE_POST", false),
            ws_sub_protocol,
        })
    }

    /// Build subscription options for this upstream.
    #[must_use]
    pub fn to_options(&self) -> SubscriptionOptions {
        let body = GraphQLBody {
            query: self.query.clone(),
            variables: self.variables.clone(),
            operation_name: self.operation_name.clone(),
            extensions: None,
        };
        SubscriptionOptions {
            use_sse: self.use_sse,
            sse_method_post: self.sse_method_post,
            ws_sub_protocol: self.ws_sub_protocol,
            ..SubscriptionOptions::new(self.url.clone(), body)
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, ConfigError> {
    let value = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&millis| millis > 0)
        .map_or(default, Duration::from_millis)
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key).map_or(default, |v| {
        matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes")
    })
}

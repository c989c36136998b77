//! Prometheus Metrics Module
//!
//! Exposes transport metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Connections**: Opened and currently active upstream connections
//! - **Messages**: Payloads delivered to subscribers
//! - **Errors**: Handshake failures and connection-fatal errors
//! - **Sharing**: Subscribes that joined an existing connection
//!
//! Every recording function is a no-op until [`init_metrics`] installs a
//! recorder.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::infrastructure::websocket::Protocol;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Repeated calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if another recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Connections
    describe_counter!(
        "subscription_transport_connections_opened_total",
        "Total upstream connections opened"
    );
    describe_gauge!(
        "subscription_transport_active_connections",
        "Number of live upstream connections"
    );

    // Messages
    describe_counter!(
        "subscription_transport_messages_delivered_total",
        "Total payloads delivered to subscribers"
    );

    // Errors
    describe_counter!(
        "subscription_transport_connection_errors_total",
        "Total connection-fatal errors by type"
    );
    describe_counter!(
        "subscription_transport_handshake_failures_total",
        "Total failed dials and handshakes by type"
    );

    // Sharing
    describe_counter!(
        "subscription_transport_handler_reuse_total",
        "Total subscribes served by an existing connection"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric label for the upstream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// `graphql-ws` over WebSocket.
    LegacyWs,
    /// `graphql-transport-ws` over WebSocket.
    TransportWs,
    /// Server-Sent Events.
    Sse,
}

impl Transport {
    const fn as_str(self) -> &'static str {
        match self {
            Self::LegacyWs => "legacy_ws",
            Self::TransportWs => "transport_ws",
            Self::Sse => "sse",
        }
    }
}

impl From<Protocol> for Transport {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Legacy => Self::LegacyWs,
            Protocol::Transport => Self::TransportWs,
        }
    }
}

/// Record a newly established upstream connection.
pub fn record_connection_opened(transport: Transport) {
    counter!(
        "subscription_transport_connections_opened_total",
        "transport" => transport.as_str()
    )
    .increment(1);
    gauge!(
        "subscription_transport_active_connections",
        "transport" => transport.as_str()
    )
    .increment(1.0);
}

/// Record an upstream connection that has shut down.
pub fn record_connection_closed(transport: Transport) {
    gauge!(
        "subscription_transport_active_connections",
        "transport" => transport.as_str()
    )
    .decrement(1.0);
}

/// Record a payload handed to a subscriber.
pub fn record_message_delivered(transport: Transport) {
    counter!(
        "subscription_transport_messages_delivered_total",
        "transport" => transport.as_str()
    )
    .increment(1);
}

/// Record a connection-fatal error.
pub fn record_connection_error(transport: Transport, error_type: &str) {
    counter!(
        "subscription_transport_connection_errors_total",
        "transport" => transport.as_str(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a failed dial or handshake.
pub fn record_handshake_failure(error_type: &str) {
    counter!(
        "subscription_transport_handshake_failures_total",
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a subscribe that joined an existing connection.
pub fn record_handler_reuse() {
    counter!("subscription_transport_handler_reuse_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_as_str() {
        assert_eq!(Transport::LegacyWs.as_str(), "legacy_ws");
        assert_eq!(Transport::TransportWs.as_str(), "transport_ws");
        assert_eq!(Transport::Sse.as_str(), "sse");
    }

    #[test]
    fn transport_from_protocol() {
        assert_eq!(Transport::from(Protocol::Legacy), Transport::LegacyWs);
        assert_eq!(Transport::from(Protocol::Transport), Transport::TransportWs);
    }

    #[test]
    fn init_is_idempotent_and_renders_recorded_metrics() {
        let first = init_metrics().unwrap();
        let second = init_metrics().unwrap();

        record_handler_reuse();
        record_handshake_failure("ack_timeout");

        let rendered = second.render();
        assert!(rendered.contains("subscription_transport_handler_reuse_total"));
        assert!(rendered.contains("error_type=\"ack_timeout\""));
        assert!(first.render().contains("subscription_transport_handshake_failures_total"));
    }

    #[test]
    fn recording_functions_never_panic() {
        record_connection_opened(Transport::Sse);
        record_message_delivered(Transport::Sse);
        record_connection_error(Transport::LegacyWs, "read");
        record_handshake_failure("ack_timeout");
        record_connection_closed(Transport::Sse);
        record_handler_reuse();
    }
}

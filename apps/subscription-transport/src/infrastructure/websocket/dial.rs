//! WebSocket Dial and Handshake
//!
//! Opens the upgrade request, resolves the sub-protocol, sends
//! `connection_init` and waits (bounded) for `connection_ack`. While
//! waiting, `ka` is ignored and `ping` is answered with `pong`.
//!
//! A connection is only handed to a handler once the ack has arrived, so
//! every failure here surfaces as the `Subscribe` call's error.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::{ProtocolError, SubProtocolError};
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{Protocol, transport};
use crate::application::ports::InitHookError;
use crate::domain::subscription::SubscriptionOptions;
use crate::infrastructure::protocol::codec::{self, CodecError};
use crate::infrastructure::protocol::messages::message_type;

/// Client WebSocket stream.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Headers managed by the handshake itself; static headers never override them.
const RESERVED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-extensions",
];

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur while establishing a WebSocket subscription connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// A static header could not be encoded.
    #[error("invalid header {name}: {reason}")]
    InvalidHeader {
        /// Header name.
        name: String,
        /// Encoding failure.
        reason: String,
    },

    /// The upstream answered the upgrade with a non-101 status.
    #[error("failed to upgrade connection to {url}, status code: {status}")]
    Upgrade {
        /// Dialled URL.
        url: String,
        /// HTTP status returned.
        status: u16,
    },

    /// The upstream negotiated a sub-protocol outside the supported set.
    #[error("provided websocket subprotocol '{0}' is not supported")]
    UnsupportedSubProtocol(String),

    /// No `connection_ack` within the handshake bound, which also covers
    /// the TCP connect and the upgrade.
    #[error("timeout while waiting for connection_ack")]
    AckTimeout,

    /// Something other than `connection_ack`, `ka` or `ping` arrived first.
    #[error("expected connection_ack or ka, got {0}")]
    UnexpectedHandshakeMessage(String),

    /// The connection-init hook failed.
    #[error(transparent)]
    ConnectionInit(#[from] InitHookError),

    /// The upstream closed the connection before acknowledging.
    #[error("connection closed during handshake")]
    ClosedDuringHandshake,

    /// Envelope encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

impl ConnectError {
    /// Short label for metrics.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidHeader { .. } => "invalid_header",
            Self::Upgrade { .. } => "upgrade",
            Self::UnsupportedSubProtocol(_) => "unsupported_subprotocol",
            Self::AckTimeout => "ack_timeout",
            Self::UnexpectedHandshakeMessage(_) => "unexpected_message",
            Self::ConnectionInit(_) => "connection_init",
            Self::ClosedDuringHandshake => "closed",
            Self::Codec(_) => "codec",
            Self::WebSocket(_) => "websocket",
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Acknowledged connection, ready for subscriptions.
#[derive(Debug)]
pub struct Connection {
    /// Underlying stream.
    pub stream: WsStream,
    /// Negotiated sub-protocol.
    pub protocol: Protocol,
}

impl Connection {
    /// Close the connection without handing it to a handler.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "Error closing unused connection");
        }
    }
}

/// Rewrite `http(s)://` to `ws(s)://`; other URLs are returned unchanged.
#[must_use]
pub fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// Dial the upstream and complete the `connection_init` / `connection_ack`
/// handshake.
///
/// `init_payload` comes from the connection-init hook; a non-null
/// `options.initial_payload` replaces it.
///
/// # Errors
///
/// Returns an error if the upgrade is rejected, the negotiated sub-protocol
/// is unsupported, or the whole handshake does not finish within
/// `ack_timeout`.
pub async fn connect(
    options: &SubscriptionOptions,
    init_payload: Option<Value>,
    config: WebSocketConfig,
    ack_timeout: Duration,
) -> Result<Connection, ConnectError> {
    let url = websocket_url(&options.url);
    tracing::info!(url = %url, sub_protocol = %options.ws_sub_protocol, "Connecting to upstream");

    match tokio::time::timeout(ack_timeout, handshake(&url, options, init_payload, config)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(url = %url, timeout_ms = ack_timeout.as_millis(), "Handshake timed out");
            Err(ConnectError::AckTimeout)
        }
    }
}

/// Upgrade, negotiate, and wait for the ack.
async fn handshake(
    url: &str,
    options: &SubscriptionOptions,
    init_payload: Option<Value>,
    config: WebSocketConfig,
) -> Result<Connection, ConnectError> {
    let offer = options.ws_sub_protocol.offered();
    let (mut stream, negotiated) = match open(url, options, Some(offer), config).await {
        Err(ConnectError::WebSocket(tungstenite::Error::Protocol(
            ProtocolError::SecWebSocketSubProtocolError(SubProtocolError::NoSubProtocol),
        ))) => {
            tracing::debug!(url = %url, "Upstream selected no sub-protocol, dialling without offer");
            open(url, options, None, config).await?
        }
        other => other?,
    };

    let protocol = Protocol::negotiate(negotiated.as_deref(), options.ws_sub_protocol)?;

    let payload = options.initial_payload().cloned().or(init_payload);
    let init = codec::connection_init(payload, options.body.extensions())?;
    stream.send(Message::Text(init.into())).await?;

    wait_for_ack(&mut stream).await?;

    tracing::info!(url = %url, protocol = %protocol, "Upstream connection acknowledged");
    Ok(Connection { stream, protocol })
}

/// Perform the upgrade request, returning the stream and negotiated protocol.
async fn open(
    url: &str,
    options: &SubscriptionOptions,
    offer: Option<&[&str]>,
    config: WebSocketConfig,
) -> Result<(WsStream, Option<String>), ConnectError> {
    let mut request = url.into_client_request()?;

    for (name, values) in &options.header {
        if RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConnectError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        for value in values {
            let header_value =
                HeaderValue::from_str(value).map_err(|e| ConnectError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            request.headers_mut().append(header_name.clone(), header_value);
        }
    }

    if let Some(offer) = offer {
        let value = HeaderValue::from_str(&offer.join(", ")).map_err(|e| {
            ConnectError::InvalidHeader {
                name: SEC_WEBSOCKET_PROTOCOL.to_string(),
                reason: e.to_string(),
            }
        })?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    let (stream, response) =
        match tokio_tungstenite::connect_async_with_config(request, Some(config), false).await {
            Ok(connected) => connected,
            Err(tungstenite::Error::Http(response)) => {
                return Err(ConnectError::Upgrade {
                    url: url.to_string(),
                    status: response.status().as_u16(),
                });
            }
            Err(e) => return Err(e.into()),
        };

    let negotiated = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok((stream, negotiated))
}

/// Read until `connection_ack`, tolerating keep-alives and pings.
async fn wait_for_ack(stream: &mut WsStream) -> Result<(), ConnectError> {
    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => {
                let envelope = codec::decode(&text)?;
                match envelope.kind.as_str() {
                    message_type::CONNECTION_ACK => return Ok(()),
                    message_type::KEEP_ALIVE => {
                        tracing::trace!("Keep-alive during handshake");
                    }
                    message_type::PING => {
                        let pong = transport::pong_message()?;
                        stream.send(Message::Text(pong.into())).await?;
                    }
                    other => {
                        return Err(ConnectError::UnexpectedHandshakeMessage(other.to_string()));
                    }
                }
            }
            Message::Close(_) => return Err(ConnectError::ClosedDuringHandshake),
            _ => {}
        }
    }
    Err(ConnectError::ClosedDuringHandshake)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("http://upstream/graphql", "ws://upstream/graphql" ; "http")]
    #[test_case("https://upstream/graphql", "wss://upstream/graphql" ; "https")]
    #[test_case("ws://upstream/graphql", "ws://upstream/graphql" ; "ws")]
    #[test_case("wss://upstream/graphql", "wss://upstream/graphql" ; "wss")]
    fn url_scheme_rewrite(input: &str, expected: &str) {
        assert_eq!(websocket_url(input), expected);
    }

    #[test]
    fn error_types_are_distinct_labels() {
        assert_eq!(ConnectError::AckTimeout.error_type(), "ack_timeout");
        assert_eq!(
            ConnectError::Upgrade {
                url: "ws://x".into(),
                status: 403
            }
            .error_type(),
            "upgrade"
        );
    }

    #[test]
    fn upgrade_error_message() {
        let err = ConnectError::Upgrade {
            url: "ws://x/graphql".into(),
            status: 401,
        };
        assert_eq!(
            err.to_string(),
            "failed to upgrade connection to ws://x/graphql, status code: 401"
        );
    }
}

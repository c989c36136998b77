//! WebSocket Connection Handlers
//!
//! One handler owns one physical connection and multiplexes every
//! subscriber that hashed to it. Both sub-protocols share the same
//! lifecycle and differ only in message vocabulary:
//!
//! | Phase | `graphql-ws` | `graphql-transport-ws` |
//! |---|---|---|
//! | subscribe | `start` | `subscribe` |
//! | result | `data` | `next` |
//! | cancel | `stop` | `complete` |
//! | keep-alive | `ka` (ignored) | `ping` → `pong` |
//! | fatal | `connection_error` | read/write failure |

pub mod dial;
pub mod handler;
pub mod legacy;
pub mod reader;
pub mod transport;

pub use dial::{ConnectError, Connection, WsStream, connect, websocket_url};
pub use handler::WsConnectionHandler;
pub use reader::{FrameResult, ReadError, spawn_reader};

use crate::domain::subscription::{GraphQLBody, WsSubProtocol};
use crate::infrastructure::protocol::CodecError;

/// Negotiated sub-protocol of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// `graphql-ws`.
    Legacy,
    /// `graphql-transport-ws`.
    Transport,
}

/// Classification of an inbound message under one sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// Result for one subscription.
    Data,
    /// Upstream finished one subscription.
    Complete,
    /// Error for one subscription.
    Error,
    /// Connection-fatal error.
    ConnectionError,
    /// Ping that must be answered.
    Ping,
    /// Keep-alive or acknowledgement, nothing to do.
    KeepAlive,
    /// Message belonging to the other sub-protocol.
    Mismatch,
    /// Unrecognized message type.
    Unknown,
}

impl Protocol {
    /// Resolve the protocol from the upgrade response.
    ///
    /// A pinned preference wins. In auto mode the negotiated header is used,
    /// defaulting to `graphql-ws` when the upstream expressed none.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream negotiated an unknown sub-protocol.
    pub fn negotiate(
        negotiated: Option<&str>,
        preference: WsSubProtocol,
    ) -> Result<Self, ConnectError> {
        match preference {
            WsSubProtocol::Legacy => Ok(Self::Legacy),
            WsSubProtocol::Transport => Ok(Self::Transport),
            WsSubProtocol::Auto => match negotiated.map(str::trim) {
                None | Some("" | WsSubProtocol::LEGACY) => Ok(Self::Legacy),
                Some(WsSubProtocol::TRANSPORT) => Ok(Self::Transport),
                Some(other) => Err(ConnectError::UnsupportedSubProtocol(other.to_string())),
            },
        }
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => WsSubProtocol::LEGACY,
            Self::Transport => WsSubProtocol::TRANSPORT,
        }
    }

    /// Envelope starting subscription `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be serialized.
    pub fn subscribe_message(self, id: &str, body: &GraphQLBody) -> Result<String, CodecError> {
        match self {
            Self::Legacy => legacy::start_message(id, body),
            Self::Transport => transport::subscribe_message(id, body),
        }
    }

    /// Envelope cancelling subscription `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be serialized.
    pub fn unsubscribe_message(self, id: &str) -> Result<String, CodecError> {
        match self {
            Self::Legacy => legacy::stop_message(id),
            Self::Transport => transport::complete_message(id),
        }
    }

    /// Classify an inbound message type.
    #[must_use]
    pub fn classify(self, kind: &str) -> ServerEvent {
        match self {
            Self::Legacy => legacy::classify(kind),
            Self::Transport => transport::classify(kind),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(None, WsSubProtocol::Auto, Protocol::Legacy ; "auto without header")]
    #[test_case(Some(""), WsSubProtocol::Auto, Protocol::Legacy ; "auto with empty header")]
    #[test_case(Some("graphql-ws"), WsSubProtocol::Auto, Protocol::Legacy ; "auto legacy")]
    #[test_case(Some("graphql-transport-ws"), WsSubProtocol::Auto, Protocol::Transport ; "auto transport")]
    #[test_case(None, WsSubProtocol::Transport, Protocol::Transport ; "pinned transport")]
    #[test_case(Some("graphql-transport-ws"), WsSubProtocol::Legacy, Protocol::Legacy ; "pinned legacy wins")]
    fn negotiation(header: Option<&str>, preference: WsSubProtocol, expected: Protocol) {
        assert_eq!(Protocol::negotiate(header, preference).unwrap(), expected);
    }

    #[test]
    fn unknown_negotiated_protocol_rejected() {
        let err = Protocol::negotiate(Some("graphql-sse"), WsSubProtocol::Auto).unwrap_err();
        assert!(matches!(err, ConnectError::UnsupportedSubProtocol(p) if p == "graphql-sse"));
    }

    #[test]
    fn unsubscribe_vocabulary_differs() {
        assert_eq!(
            Protocol::Legacy.unsubscribe_message("3").unwrap(),
            r#"{"type":"stop","id":"3"}"#
        );
        assert_eq!(
            Protocol::Transport.unsubscribe_message("3").unwrap(),
            r#"{"type":"complete","id":"3"}"#
        );
    }
}

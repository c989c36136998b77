//! Wire Message Types
//!
//! Envelopes of both WebSocket sub-protocols. Outbound messages borrow
//! from the caller; inbound messages keep `payload` as raw JSON text so
//! results reach subscribers byte-for-byte.
//!
//! # Outbound
//!
//! | Message | Legacy (`graphql-ws`) | Transport (`graphql-transport-ws`) |
//! |---|---|---|
//! | handshake | `connection_init` | `connection_init` |
//! | subscribe | `start` | `subscribe` |
//! | cancel | `stop` | `complete` |
//! | keep-alive | | `pong` |
//!
//! # Inbound
//!
//! `connection_ack`, `ka`, `data`/`next`, `complete`, `error`,
//! `connection_error`, `ping`, `pong`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;

use crate::domain::subscription::GraphQLBody;

/// Values of the `type` field.
pub mod message_type {
    /// Handshake request.
    pub const CONNECTION_INIT: &str = "connection_init";
    /// Handshake acknowledgement.
    pub const CONNECTION_ACK: &str = "connection_ack";
    /// Legacy connection-fatal error.
    pub const CONNECTION_ERROR: &str = "connection_error";
    /// Legacy keep-alive.
    pub const KEEP_ALIVE: &str = "ka";
    /// Legacy operation start.
    pub const START: &str = "start";
    /// Legacy operation stop.
    pub const STOP: &str = "stop";
    /// Legacy operation result.
    pub const DATA: &str = "data";
    /// Transport operation start.
    pub const SUBSCRIBE: &str = "subscribe";
    /// Transport operation result.
    pub const NEXT: &str = "next";
    /// Operation finished (both directions for transport).
    pub const COMPLETE: &str = "complete";
    /// Operation error.
    pub const ERROR: &str = "error";
    /// Transport ping.
    pub const PING: &str = "ping";
    /// Transport pong.
    pub const PONG: &str = "pong";
}

/// Message sent to the upstream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage<'a> {
    /// Handshake request, both sub-protocols.
    ConnectionInit {
        /// Optional init payload.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<&'a Value>,
    },
    /// Legacy: start an operation.
    Start {
        /// Subscription id.
        id: &'a str,
        /// GraphQL body.
        payload: &'a GraphQLBody,
    },
    /// Legacy: stop an operation.
    Stop {
        /// Subscription id.
        id: &'a str,
    },
    /// Transport: start an operation.
    Subscribe {
        /// Subscription id.
        id: &'a str,
        /// GraphQL body.
        payload: &'a GraphQLBody,
    },
    /// Transport: stop an operation.
    Complete {
        /// Subscription id.
        id: &'a str,
    },
    /// Transport: keep-alive reply.
    Pong,
}

/// Message received from the upstream.
#[derive(Debug, Deserialize)]
pub struct ServerMessage {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Subscription id, absent on connection-level messages.
    #[serde(default)]
    pub id: Option<String>,
    /// Raw payload JSON.
    #[serde(default)]
    pub payload: Option<Box<RawValue>>,
}

impl ServerMessage {
    /// Raw payload text, if any.
    #[must_use]
    pub fn payload_text(&self) -> Option<&str> {
        self.payload.as_deref().map(RawValue::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_message_shape() {
        let body = GraphQLBody::new("subscription { a }");
        let json = serde_json::to_string(&ClientMessage::Start {
            id: "1",
            payload: &body,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"start","id":"1","payload":{"query":"subscription { a }"}}"#
        );
    }

    #[test]
    fn complete_message_shape() {
        let json = serde_json::to_string(&ClientMessage::Complete { id: "7" }).unwrap();
        assert_eq!(json, r#"{"type":"complete","id":"7"}"#);
    }

    #[test]
    fn pong_message_shape() {
        assert_eq!(
            serde_json::to_string(&ClientMessage::Pong).unwrap(),
            r#"{"type":"pong"}"#
        );
    }

    #[test]
    fn init_without_payload_omits_field() {
        let json = serde_json::to_string(&ClientMessage::ConnectionInit { payload: None }).unwrap();
        assert_eq!(json, r#"{"type":"connection_init"}"#);
    }

    #[test]
    fn server_message_keeps_raw_payload() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"id":"1","type":"next","payload":{"data": {"x" :1}}}"#)
                .unwrap();
        assert_eq!(msg.kind, message_type::NEXT);
        assert_eq!(msg.id.as_deref(), Some("1"));
        assert_eq!(msg.payload_text(), Some(r#"{"data": {"x" :1}}"#));
    }

    #[test]
    fn server_message_without_id_or_payload() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"ka"}"#).unwrap();
        assert_eq!(msg.kind, message_type::KEEP_ALIVE);
        assert!(msg.id.is_none());
        assert!(msg.payload.is_none());
    }
}

//! `graphql-ws` Vocabulary
//!
//! The legacy subscriptions-transport-ws protocol: operations start with
//! `start`, results arrive as `data`, the client cancels with `stop`, the
//! server keeps the connection alive with `ka` and may end it with
//! `connection_error`.

use super::ServerEvent;
use crate::domain::subscription::GraphQLBody;
use crate::infrastructure::protocol::codec::{self, CodecError};
use crate::infrastructure::protocol::messages::{ClientMessage, message_type};

/// `{"type":"start","id":ID,"payload":BODY}`
///
/// # Errors
///
/// Returns an error if the body cannot be serialized.
pub fn start_message(id: &str, body: &GraphQLBody) -> Result<String, CodecError> {
    codec::encode(&ClientMessage::Start { id, payload: body })
}

/// `{"type":"stop","id":ID}`
///
/// # Errors
///
/// Returns an error if the envelope cannot be serialized.
pub fn stop_message(id: &str) -> Result<String, CodecError> {
    codec::encode(&ClientMessage::Stop { id })
}

/// Classify an inbound message type on a legacy connection.
#[must_use]
pub fn classify(kind: &str) -> ServerEvent {
    match kind {
        message_type::DATA => ServerEvent::Data,
        message_type::COMPLETE => ServerEvent::Complete,
        message_type::ERROR => ServerEvent::Error,
        message_type::CONNECTION_ERROR => ServerEvent::ConnectionError,
        message_type::KEEP_ALIVE | message_type::CONNECTION_ACK => ServerEvent::KeepAlive,
        message_type::PING | message_type::NEXT => ServerEvent::Mismatch,
        _ => ServerEvent::Unknown,
    }
}

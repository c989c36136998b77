//! `graphql-transport-ws` Vocabulary
//!
//! Operations start with `subscribe`, results arrive as `next`, either side
//! ends an operation with `complete`, and every `ping` must be answered
//! with `pong`.

use super::ServerEvent;
use crate::domain::subscription::GraphQLBody;
use crate::infrastructure::protocol::codec::{self, CodecError};
use crate::infrastructure::protocol::messages::{ClientMessage, message_type};

/// `{"type":"subscribe","id":ID,"payload":BODY}`
///
/// # Errors
///
/// Returns an error if the body cannot be serialized.
pub fn subscribe_message(id: &str, body: &GraphQLBody) -> Result<String, CodecError> {
    codec::encode(&ClientMessage::Subscribe { id, payload: body })
}

/// `{"type":"complete","id":ID}`
///
/// # Errors
///
/// Returns an error if the envelope cannot be serialized.
pub fn complete_message(id: &str) -> Result<String, CodecError> {
    codec::encode(&ClientMessage::Complete { id })
}

/// `{"type":"pong"}`
///
/// # Errors
///
/// Returns an error if the envelope cannot be serialized.
pub fn pong_message() -> Result<String, CodecError> {
    codec::encode(&ClientMessage::Pong)
}

/// Classify an inbound message type on a transport connection.
#[must_use]
pub fn classify(kind: &str) -> ServerEvent {
    match kind {
        message_type::NEXT => ServerEvent::Data,
        message_type::COMPLETE => ServerEvent::Complete,
        message_type::ERROR => ServerEvent::Error,
        message_type::PING => ServerEvent::Ping,
        message_type::PONG | message_type::KEEP_ALIVE | message_type::CONNECTION_ACK => {
            ServerEvent::KeepAlive
        }
        message_type::DATA | message_type::CONNECTION_ERROR => ServerEvent::Mismatch,
        _ => ServerEvent::Unknown,
    }
}

//! GraphQL-over-WebSocket Wire Envelopes
//!
//! Pure construction and extraction of the small JSON envelopes exchanged
//! with upstreams. No I/O lives here.

pub mod codec;
pub mod messages;

pub use codec::{CONNECTION_ERROR, CodecError, INTERNAL_ERROR};
pub use messages::{ClientMessage, ServerMessage, message_type};

//! Envelope Codec
//!
//! Encoding of outbound envelopes, decoding of inbound ones, and the
//! normalized error envelopes every subscriber receives:
//!
//! - `[..]` error payload → `{"errors":[..]}`
//! - `{..}` error payload → `{"errors":[{..}]}`
//! - anything else → [`INTERNAL_ERROR`]

use std::fmt::Display;

use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{Map, Value, json};

use super::messages::{ClientMessage, ServerMessage};

/// Generic failure envelope.
pub const INTERNAL_ERROR: &str = r#"{"errors":[{"message":"internal error"}]}"#;

/// Envelope delivered when a legacy upstream sends `connection_error`.
pub const CONNECTION_ERROR: &str = r#"{"errors":[{"message":"connection error"}]}"#;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an outbound envelope.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn encode(message: &ClientMessage<'_>) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode an inbound envelope.
///
/// # Errors
///
/// Returns an error if the text is not a JSON object with a `type` field.
pub fn decode(text: &str) -> Result<ServerMessage, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Build the `connection_init` envelope.
///
/// Non-empty `extensions` are placed at `payload.extensions`, creating the
/// payload object when needed. A non-object payload is sent unchanged.
///
/// # Errors
///
/// Returns an error if the envelope cannot be serialized.
pub fn connection_init(
    payload: Option<Value>,
    extensions: Option<&Value>,
) -> Result<String, CodecError> {
    let payload = match (payload, extensions) {
        (Some(Value::Object(mut map)), Some(ext)) => {
            map.insert("extensions".to_string(), ext.clone());
            Some(Value::Object(map))
        }
        (None | Some(Value::Null), Some(ext)) => {
            let mut map = Map::new();
            map.insert("extensions".to_string(), ext.clone());
            Some(Value::Object(map))
        }
        (Some(Value::Null), None) => None,
        (payload, _) => payload,
    };
    encode(&ClientMessage::ConnectionInit {
        payload: payload.as_ref(),
    })
}

/// Envelope carrying a single error message.
#[must_use]
pub fn error_envelope(message: impl Display) -> String {
    json!({ "errors": [{ "message": message.to_string() }] }).to_string()
}

/// Wrap an array or object error payload, keeping its text verbatim.
///
/// Returns `None` for any other JSON shape.
#[must_use]
pub fn wrap_errors(raw: &RawValue) -> Option<String> {
    let text = raw.get().trim();
    match text.as_bytes().first() {
        Some(b'[') => Some(format!(r#"{{"errors":{text}}}"#)),
        Some(b'{') => Some(format!(r#"{{"errors":[{text}]}}"#)),
        _ => None,
    }
}

/// Normalize the payload of an `error` message.
#[must_use]
pub fn normalize_error_payload(raw: Option<&RawValue>) -> String {
    raw.and_then(wrap_errors)
        .unwrap_or_else(|| INTERNAL_ERROR.to_string())
}

#[derive(Deserialize)]
struct ErrorsOnly<'a> {
    #[serde(borrow, default)]
    errors: Option<&'a RawValue>,
}

/// Extract a normalized envelope from a bare JSON line carrying `errors`.
///
/// Some SSE upstreams report failures as a plain JSON object with no event
/// header. Lines that are not JSON objects, or whose `errors` is neither an
/// array nor an object, yield `None`.
#[must_use]
pub fn errors_line(line: &str) -> Option<String> {
    let parsed: ErrorsOnly<'_> = serde_json::from_str(line.trim()).ok()?;
    parsed.errors.and_then(wrap_errors)
}

// =============================================================================
// Tests
// =============================================================================

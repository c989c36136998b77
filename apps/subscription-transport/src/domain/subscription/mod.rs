//! Subscription Request Types
//!
//! Immutable description of one upstream subscription request, as supplied
//! by the caller of `Subscribe`. Options are built once per call and never
//! mutated afterwards; handlers share them behind an `Arc`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

// =============================================================================
// GraphQL Body
// =============================================================================

/// GraphQL request body forwarded to the upstream.
///
/// Serialises with the field names upstream servers expect
/// (`operationName`), omitting empty fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLBody {
    /// Operation document.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    /// Operation variables.
    #[serde(default, skip_serializing_if = "is_absent")]
    pub variables: Option<Value>,
    /// Name of the operation to execute.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation_name: String,
    /// Protocol extensions (persisted queries, tracing, ...).
    #[serde(default, skip_serializing_if = "is_absent")]
    pub extensions: Option<Value>,
}

impl GraphQLBody {
    /// Create a body carrying only a query.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Variables, if present and not `null`.
    #[must_use]
    pub fn variables(&self) -> Option<&Value> {
        self.variables.as_ref().filter(|v| !v.is_null())
    }

    /// Extensions, if present and not `null`.
    #[must_use]
    pub fn extensions(&self) -> Option<&Value> {
        self.extensions.as_ref().filter(|v| !v.is_null())
    }
}

#[allow(clippy::ref_option)]
fn is_absent(value: &Option<Value>) -> bool {
    value.as_ref().is_none_or(Value::is_null)
}

// =============================================================================
// WebSocket Sub-Protocol
// =============================================================================

/// WebSocket sub-protocol preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WsSubProtocol {
    /// Offer both and use whatever the upstream negotiates.
    #[default]
    Auto,
    /// Legacy `graphql-ws` (subscriptions-transport-ws).
    Legacy,
    /// `graphql-transport-ws` (graphql-ws library).
    Transport,
}

impl WsSubProtocol {
    /// Wire name of the legacy sub-protocol.
    pub const LEGACY: &'static str = "graphql-ws";
    /// Wire name of the transport sub-protocol.
    pub const TRANSPORT: &'static str = "graphql-transport-ws";

    /// Wire name, or `"auto"` when unpinned.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Legacy => Self::LEGACY,
            Self::Transport => Self::TRANSPORT,
        }
    }

    /// Sub-protocols offered in the upgrade request.
    #[must_use]
    pub const fn offered(&self) -> &'static [&'static str] {
        match self {
            Self::Auto => &[Self::LEGACY, Self::TRANSPORT],
            Self::Legacy => &[Self::LEGACY],
            Self::Transport => &[Self::TRANSPORT],
        }
    }
}

impl fmt::Display for WsSubProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-protocol name outside the supported set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown websocket sub-protocol: {0}")]
pub struct UnknownSubProtocol(pub String);

impl FromStr for WsSubProtocol {
    type Err = UnknownSubProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "auto" => Ok(Self::Auto),
            Self::LEGACY => Ok(Self::Legacy),
            Self::TRANSPORT => Ok(Self::Transport),
            other => Err(UnknownSubProtocol(other.to_string())),
        }
    }
}

// =============================================================================
// Subscription Options
// =============================================================================

/// Everything needed to open one upstream subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    /// Upstream URL (`http(s)://` is rewritten to `ws(s)://` for WebSocket).
    pub url: String,
    /// Static headers sent with the upgrade or SSE request.
    pub header: BTreeMap<String, Vec<String>>,
    /// GraphQL request body.
    pub body: GraphQLBody,
    /// Use Server-Sent-Events instead of WebSocket.
    pub use_sse: bool,
    /// For SSE, send a POST with a JSON body instead of a GET.
    pub sse_method_post: bool,
    /// WebSocket sub-protocol preference.
    pub ws_sub_protocol: WsSubProtocol,
    /// Payload for `connection_init`, replacing any hook-provided payload.
    pub initial_payload: Option<Value>,
    /// Client request headers whose values separate connections.
    pub forwarded_client_header_names: Vec<String>,
    /// Patterns over client request header names whose values separate connections.
    pub forwarded_client_header_regular_expressions: Vec<Regex>,
}

impl SubscriptionOptions {
    /// Create options for a URL and body with every other field defaulted.
    #[must_use]
    pub fn new(url: impl Into<String>, body: GraphQLBody) -> Self {
        Self {
            url: url.into(),
            body,
            ..Self::default()
        }
    }

    /// Add a static header value.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.entry(name.into()).or_default().push(value.into());
        self
    }

    /// Initial payload, if present and not `null`.
    #[must_use]
    pub fn initial_payload(&self) -> Option<&Value> {
        self.initial_payload.as_ref().filter(|v| !v.is_null())
    }
}

// =============================================================================
// Request Scope
// =============================================================================

/// The caller's request context.
///
/// `cancel` ends only this subscriber. `headers` are the inbound client
/// request headers, consulted for forwarded-header deduplication.
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    /// Cancelled when the subscriber goes away.
    pub cancel: CancellationToken,
    /// Inbound client request headers.
    pub headers: HeaderMap,
}

impl RequestScope {
    /// Create a scope from a token and the inbound headers.
    #[must_use]
    pub const fn new(cancel: CancellationToken, headers: HeaderMap) -> Self {
        Self { cancel, headers }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test_case("", WsSubProtocol::Auto ; "empty")]
    #[test_case("auto", WsSubProtocol::Auto ; "auto")]
    #[test_case("graphql-ws", WsSubProtocol::Legacy ; "legacy")]
    #[test_case("graphql-transport-ws", WsSubProtocol::Transport ; "transport")]
    fn sub_protocol_parsing(input: &str, expected: WsSubProtocol) {
        assert_eq!(input.parse::<WsSubProtocol>().unwrap(), expected);
    }

    #[test]
    fn unknown_sub_protocol_rejected() {
        let err = "graphql-sse".parse::<WsSubProtocol>().unwrap_err();
        assert_eq!(err, UnknownSubProtocol("graphql-sse".to_string()));
    }

    #[test]
    fn auto_offers_both_protocols() {
        assert_eq!(
            WsSubProtocol::Auto.offered(),
            &["graphql-ws", "graphql-transport-ws"]
        );
        assert_eq!(WsSubProtocol::Transport.offered(), &["graphql-transport-ws"]);
    }

    #[test]
    fn body_serialization_omits_empty_fields() {
        let body = GraphQLBody::new("subscription { tick }");
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"query":"subscription { tick }"}"#
        );
    }

    #[test]
    fn body_serialization_uses_operation_name() {
        let body = GraphQLBody {
            query: "subscription S { tick }".to_string(),
            variables: Some(json!({"a": 1})),
            operation_name: "S".to_string(),
            extensions: Some(Value::Null),
        };
        let value: Value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["operationName"], "S");
        assert_eq!(value["variables"], json!({"a": 1}));
        assert!(value.get("extensions").is_none());
    }

    #[test]
    fn null_variables_treated_as_absent() {
        let body = GraphQLBody {
            variables: Some(Value::Null),
            ..GraphQLBody::default()
        };
        assert!(body.variables().is_none());
    }

    #[test]
    fn with_header_appends_values() {
        let options = SubscriptionOptions::new("ws://localhost", GraphQLBody::default())
            .with_header("X-A", "1")
            .with_header("X-A", "2");
        assert_eq!(options.header["X-A"], vec!["1".to_string(), "2".to_string()]);
    }
}

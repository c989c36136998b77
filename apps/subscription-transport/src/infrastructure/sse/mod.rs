//! Server-Sent-Events Transport
//!
//! SSE cannot multiplex, so every subscriber gets its own request and its
//! own [`SseConnectionHandler`]. The request is a GET carrying the body as
//! query parameters, or a POST with a JSON body when `sse_method_post` is
//! set. A non-success status fails the subscribe call before any handler
//! starts.

pub mod frames;
pub mod handler;

pub use frames::EventStreamReader;
pub use handler::SseConnectionHandler;

use reqwest::header::{
    ACCEPT, CACHE_CONTROL, CONNECTION, HeaderMap, HeaderName, HeaderValue,
};
use reqwest::{Client, RequestBuilder, Response};

use crate::domain::subscription::SubscriptionOptions;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur while opening an SSE subscription.
#[derive(Debug, thiserror::Error)]
pub enum SseError {
    /// A static header could not be encoded.
    #[error("invalid header {name}: {reason}")]
    InvalidHeader {
        /// Header name.
        name: String,
        /// Encoding failure.
        reason: String,
    },

    /// The request could not be sent.
    #[error("SSE request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The upstream answered with a non-success status.
    #[error("failed to connect to stream {url}, unexpected status code: {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status returned.
        status: u16,
    },
}

impl SseError {
    /// Short label for metrics.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidHeader { .. } => "invalid_header",
            Self::Request(_) => "request",
            Self::Status { .. } => "status",
        }
    }
}

// =============================================================================
// Request
// =============================================================================

/// Build the streaming request for `options`.
///
/// # Errors
///
/// Returns an error if a static header is not a valid HTTP header.
pub fn build_request(client: &Client, options: &SubscriptionOptions) -> Result<RequestBuilder, SseError> {
    let request = if options.sse_method_post {
        client.post(&options.url).json(&options.body)
    } else {
        client.get(&options.url).query(&query_params(options))
    };

    Ok(request.headers(headers(options)?))
}

/// Send the request and check the status.
///
/// # Errors
///
/// Returns an error if the request fails or the status is not 2xx.
pub async fn open(client: &Client, options: &SubscriptionOptions) -> Result<Response, SseError> {
    let response = build_request(client, options)?.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(SseError::Status {
            url: options.url.clone(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}

/// GET parameters, each present only when the body field is non-empty.
fn query_params(options: &SubscriptionOptions) -> Vec<(&'static str, String)> {
    let body = &options.body;
    let mut params = Vec::with_capacity(4);
    if !body.query.is_empty() {
        params.push(("query", body.query.clone()));
    }
    if let Some(variables) = body.variables() {
        params.push(("variables", variables.to_string()));
    }
    if !body.operation_name.is_empty() {
        params.push(("operationName", body.operation_name.clone()));
    }
    if let Some(extensions) = body.extensions() {
        params.push(("extensions", extensions.to_string()));
    }
    params
}

fn headers(options: &SubscriptionOptions) -> Result<HeaderMap, SseError> {
    let mut headers = HeaderMap::new();
    for (name, values) in &options.header {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| SseError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        for value in values {
            let header_value = HeaderValue::from_str(value).map_err(|e| SseError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
            headers.append(header_name.clone(), header_value);
        }
    }

    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::subscription::GraphQLBody;

    fn options() -> SubscriptionOptions {
        let mut body = GraphQLBody::new("subscription { tick }");
        body.variables = Some(json!({"n": 1}));
        SubscriptionOptions {
            use_sse: true,
            ..SubscriptionOptions::new("http://upstream/graphql", body)
        }
    }

    #[test]
    fn get_parameters_skip_empty_fields() {
        let params = query_params(&options());
        assert_eq!(
            params,
            vec![
                ("query", "subscription { tick }".to_string()),
                ("variables", r#"{"n":1}"#.to_string()),
            ]
        );
    }

    #[test]
    fn get_request_carries_query_and_stream_headers() {
        let opts = options().with_header("Authorization", "Bearer t");
        let request = build_request(&Client::new(), &opts).unwrap().build().unwrap();

        assert_eq!(request.method(), reqwest::Method::GET);
        let pairs: Vec<(String, String)> = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("query".to_string(), "subscription { tick }".to_string())));
        assert_eq!(request.headers()[ACCEPT], "text/event-stream");
        assert_eq!(request.headers()[CACHE_CONTROL], "no-cache");
        assert_eq!(request.headers()[CONNECTION], "keep-alive");
        assert_eq!(request.headers()["authorization"], "Bearer t");
    }

    #[test]
    fn post_request_sends_json_body() {
        let mut opts = options();
        opts.sse_method_post = true;
        let request = build_request(&Client::new(), &opts).unwrap().build().unwrap();

        assert_eq!(request.method(), reqwest::Method::POST);
        assert!(request.url().query().is_none());
        let body: serde_json::Value =
            serde_json::from_slice(request.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["query"], "subscription { tick }");
        assert_eq!(body["variables"], json!({"n": 1}));
    }

    #[test]
    fn invalid_static_header_is_rejected() {
        let opts = options().with_header("Bad Header", "x");
        let err = build_request(&Client::new(), &opts).unwrap_err();
        assert!(matches!(err, SseError::InvalidHeader { name, .. } if name == "Bad Header"));
    }
}

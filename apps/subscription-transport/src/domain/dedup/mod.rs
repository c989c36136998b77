//! Connection Deduplication Hash
//!
//! Two subscribe requests share one upstream connection exactly when their
//! hashes are equal. The digest is a streaming xxh64 fed, in this order:
//!
//! 1. `sse:true` when SSE is selected, `sse_method_post:true` when SSE uses POST
//! 2. the upstream URL
//! 3. every static header as `Name: value\r\n`, names in sorted order
//! 4. each forwarded header name followed by its values on the client request
//! 5. each forwarded header pattern followed by the values of every client
//!    header whose canonical name matches it (names in sorted order)
//! 6. the initial payload, extensions, query, variables and operation name,
//!    each only when non-empty
//!
//! The order is fixed so that hashes are reproducible across runs.

use reqwest::header::HeaderMap;
use xxhash_rust::xxh64::Xxh64;

use super::subscription::SubscriptionOptions;

const WITH_SSE: &[u8] = b"sse:true";
const WITH_SSE_METHOD_POST: &[u8] = b"sse_method_post:true";

/// Compute the deduplication hash of a subscribe request.
///
/// `request_headers` are the inbound client request headers; only those
/// selected by the forwarded names and patterns in `options` participate.
#[must_use]
pub fn subscription_hash(options: &SubscriptionOptions, request_headers: &HeaderMap) -> u64 {
    let mut digest = Xxh64::new(0);

    if options.use_sse {
        digest.update(WITH_SSE);
    }
    if options.sse_method_post {
        digest.update(WITH_SSE_METHOD_POST);
    }

    digest.update(options.url.as_bytes());

    for (name, values) in &options.header {
        for value in values {
            digest.update(name.as_bytes());
            digest.update(b": ");
            digest.update(value.as_bytes());
            digest.update(b"\r\n");
        }
    }

    for name in &options.forwarded_client_header_names {
        digest.update(name.as_bytes());
        for value in request_headers.get_all(name.as_str()) {
            digest.update(value.as_bytes());
        }
    }

    if !options.forwarded_client_header_regular_expressions.is_empty() {
        let mut names: Vec<(String, &str)> = request_headers
            .keys()
            .map(|name| (canonical_header_key(name.as_str()), name.as_str()))
            .collect();
        names.sort_unstable();

        for pattern in &options.forwarded_client_header_regular_expressions {
            digest.update(pattern.as_str().as_bytes());
            for (canonical, raw) in &names {
                if pattern.is_match(canonical) {
                    for value in request_headers.get_all(*raw) {
                        digest.update(value.as_bytes());
                    }
                }
            }
        }
    }

    if let Some(payload) = options.initial_payload() {
        digest.update(payload.to_string().as_bytes());
    }

    let body = &options.body;
    if let Some(extensions) = body.extensions() {
        digest.update(extensions.to_string().as_bytes());
    }
    if !body.query.is_empty() {
        digest.update(body.query.as_bytes());
    }
    if let Some(variables) = body.variables() {
        digest.update(variables.to_string().as_bytes());
    }
    if !body.operation_name.is_empty() {
        digest.update(body.operation_name.as_bytes());
    }

    digest.digest()
}

/// Canonical MIME form of a header name (`x-request-id` → `X-Request-Id`).
#[must_use]
pub fn canonical_header_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use regex::Regex;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    use super::*;
    use crate::domain::subscription::GraphQLBody;

    fn options() -> SubscriptionOptions {
        SubscriptionOptions::new(
            "ws://upstream/graphql",
            GraphQLBody::new("subscription { tick }"),
        )
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn canonical_key_title_cases_segments() {
        assert_eq!(canonical_header_key("x-request-id"), "X-Request-Id");
        assert_eq!(canonical_header_key("AUTHORIZATION"), "Authorization");
    }

    #[test]
    fn identical_requests_hash_equal() {
        let a = subscription_hash(&options(), &HeaderMap::new());
        let b = subscription_hash(&options(), &HeaderMap::new());
        assert_eq!(a, b);
    }

    #[test]
    fn unforwarded_client_headers_do_not_matter() {
        let a = subscription_hash(&options(), &headers(&[("authorization", "a")]));
        let b = subscription_hash(&options(), &headers(&[("authorization", "b")]));
        assert_eq!(a, b);
    }

    #[test]
    fn forwarded_header_value_separates_connections() {
        let mut opts = options();
        opts.forwarded_client_header_names = vec!["Authorization".to_string()];

        let a = subscription_hash(&opts, &headers(&[("authorization", "token-a")]));
        let b = subscription_hash(&opts, &headers(&[("authorization", "token-b")]));
        assert_ne!(a, b);
    }

    #[test]
    fn header_pattern_matches_canonical_names() {
        let mut opts = options();
        opts.forwarded_client_header_regular_expressions =
            vec![Regex::new("^X-Tenant-").unwrap()];

        let a = subscription_hash(&opts, &headers(&[("x-tenant-id", "1")]));
        let b = subscription_hash(&opts, &headers(&[("x-tenant-id", "2")]));
        let c = subscription_hash(&opts, &headers(&[("x-other", "2")]));
        let d = subscription_hash(&opts, &HeaderMap::new());
        assert_ne!(a, b);
        assert_eq!(c, d);
    }

    #[test]
    fn pattern_hash_ignores_header_insertion_order() {
        let mut opts = options();
        opts.forwarded_client_header_regular_expressions = vec![Regex::new("^X-").unwrap()];

        let a = subscription_hash(&opts, &headers(&[("x-a", "1"), ("x-b", "2")]));
        let b = subscription_hash(&opts, &headers(&[("x-b", "2"), ("x-a", "1")]));
        assert_eq!(a, b);
    }

    #[test]
    fn transport_flags_participate() {
        let ws = options();
        let mut sse = options();
        sse.use_sse = true;
        let mut sse_post = sse.clone();
        sse_post.sse_method_post = true;

        let empty = HeaderMap::new();
        assert_ne!(subscription_hash(&ws, &empty), subscription_hash(&sse, &empty));
        assert_ne!(
            subscription_hash(&sse, &empty),
            subscription_hash(&sse_post, &empty)
        );
    }

    #[test]
    fn initial_payload_participates() {
        let mut with_payload = options();
        with_payload.initial_payload = Some(json!({"token": "x"}));
        let empty = HeaderMap::new();
        assert_ne!(
            subscription_hash(&options(), &empty),
            subscription_hash(&with_payload, &empty)
        );
    }

    #[test]
    fn null_variables_hash_like_missing_variables() {
        let mut with_null = options();
        with_null.body.variables = Some(serde_json::Value::Null);
        let empty = HeaderMap::new();
        assert_eq!(
            subscription_hash(&options(), &empty),
            subscription_hash(&with_null, &empty)
        );
    }

    proptest! {
        #[test]
        fn hash_is_deterministic(url in "[a-z]{1,12}", query in "[a-z {}]{0,24}", header in "[a-z0-9]{0,8}") {
            let mut opts = SubscriptionOptions::new(format!("ws://{url}"), GraphQLBody::new(query));
            opts.forwarded_client_header_names = vec!["x-token".to_string()];
            let request = headers(&[("x-token", header.as_str())]);
            prop_assert_eq!(subscription_hash(&opts, &request), subscription_hash(&opts.clone(), &request.clone()));
        }

        #[test]
        fn operation_name_change_alters_hash(a in "[A-Za-z]{1,10}", b in "[A-Za-z]{1,10}") {
            prop_assume!(a != b);
            let mut left = options();
            left.body.operation_name = a;
            let mut right = options();
            right.body.operation_name = b;
            let empty = HeaderMap::new();
            prop_assert_ne!(subscription_hash(&left, &empty), subscription_hash(&right, &empty));
        }
    }
}

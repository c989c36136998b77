//! SSE Streaming Integration Tests
//!
//! Runs the client's Server-Sent-Events path against a wiremock upstream.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use subscription_transport::{
    ChannelUpdater, CloseKind, GraphQLBody, RequestScope, SseError, SubscribeError,
    SubscriptionClient, SubscriptionEvent, SubscriptionOptions,
};

const QUERY: &str = "subscription { tick }";

fn sse_client() -> SubscriptionClient {
    SubscriptionClient::builder(CancellationToken::new())
        .with_streaming_client(reqwest::Client::new())
        .build()
}

fn sse_options(server: &MockServer) -> SubscriptionOptions {
    let mut options =
        SubscriptionOptions::new(format!("{}/graphql", server.uri()), GraphQLBody::new(QUERY));
    options.use_sse = true;
    options
}

fn event_stream(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

async fn subscribe(
    client: &SubscriptionClient,
    options: SubscriptionOptions,
) -> mpsc::Receiver<SubscriptionEvent> {
    let (updater, rx) = ChannelUpdater::channel(16);
    client
        .subscribe(
            &RequestScope::new(CancellationToken::new(), HeaderMap::new()),
            options,
            Arc::new(updater),
        )
        .await
        .unwrap();
    rx
}

async fn collect(mut rx: mpsc::Receiver<SubscriptionEvent>) -> Vec<SubscriptionEvent> {
    let mut events = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for subscriber event")
            .expect("subscriber channel closed");
        let closed = matches!(event, SubscriptionEvent::Closed(_));
        events.push(event);
        if closed {
            return events;
        }
    }
}

#[tokio::test]
async fn get_stream_delivers_events_until_complete() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/graphql"))
        .and(query_param("query", QUERY))
        .and(header("accept", "text/event-stream"))
        .respond_with(event_stream(
            "event: next\ndata: {\"data\":{\"tick\":1}}\n\n\
             : keep-alive\n\n\
             event: next\ndata: {\"data\":{\"tick\":2}}\n\n\
             event: complete\n\n",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let client = sse_client();
    let events = collect(subscribe(&client, sse_options(&server)).await).await;

    assert_eq!(
        events,
        vec![
            SubscriptionEvent::Update(r#"{"data":{"tick":1}}"#.to_string()),
            SubscriptionEvent::Update(r#"{"data":{"tick":2}}"#.to_string()),
            SubscriptionEvent::Closed(CloseKind::Completed),
        ]
    );
}

#[tokio::test]
async fn post_stream_sends_body_as_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({"query": QUERY})))
        .respond_with(event_stream("data: {\"data\":{\"tick\":1}}\n\n"))
        .expect(1)
        .mount(&server)
        .await;

    let client = sse_client();
    let mut options = sse_options(&server);
    options.sse_method_post = true;
    let events = collect(subscribe(&client, options).await).await;

    assert_eq!(
        events,
        vec![
            SubscriptionEvent::Update(r#"{"data":{"tick":1}}"#.to_string()),
            SubscriptionEvent::Closed(CloseKind::Completed),
        ]
    );
}

#[tokio::test]
async fn errors_line_fails_subscription() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(event_stream("{\"errors\":[{\"message\":\"denied\"}]}\n\n"))
        .mount(&server)
        .await;

    let client = sse_client();
    let events = collect(subscribe(&client, sse_options(&server)).await).await;

    assert_eq!(
        events,
        vec![
            SubscriptionEvent::Update(r#"{"errors":[{"message":"denied"}]}"#.to_string()),
            SubscriptionEvent::Closed(CloseKind::Failed),
        ]
    );
}

#[tokio::test]
async fn error_status_fails_subscribe() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = sse_client();
    let (updater, _rx) = ChannelUpdater::channel(1);
    let result = client
        .subscribe(
            &RequestScope::new(CancellationToken::new(), HeaderMap::new()),
            sse_options(&server),
            Arc::new(updater),
        )
        .await;

    assert!(matches!(
        result,
        Err(SubscribeError::Sse(SseError::Status { status: 500, .. }))
    ));
    assert_eq!(client.stats().sse_connections, 0);
}

#[tokio::test]
async fn cancelled_scope_aborts_before_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(event_stream("event: complete\n\n"))
        .expect(0)
        .mount(&server)
        .await;

    let client = sse_client();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let (updater, _rx) = ChannelUpdater::channel(1);
    let result = client
        .subscribe(
            &RequestScope::new(cancel, HeaderMap::new()),
            sse_options(&server),
            Arc::new(updater),
        )
        .await;

    assert!(matches!(result, Err(SubscribeError::Cancelled)));
}

#[tokio::test]
async fn connection_counters_settle_after_completion() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(event_stream("event: complete\n\n"))
        .mount(&server)
        .await;

    let client = sse_client();
    let events = collect(subscribe(&client, sse_options(&server)).await).await;
    assert_eq!(events, vec![SubscriptionEvent::Closed(CloseKind::Completed)]);

    timeout(Duration::from_secs(5), async {
        while client.stats().total_connections() != 0 || client.stats().subscriptions != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("counters never settled");
}

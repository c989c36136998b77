//! SSE Connection Handler
//!
//! Serves exactly one subscriber from one streaming response. Each event is
//! split into lines:
//!
//! - `data:` lines are trimmed and, when non-empty, delivered
//! - `event: complete` ends the subscription, `event: next` is a marker
//! - `:` lines are comments
//! - any other line carrying a top-level `errors` key is delivered as a
//!   normalized envelope and ends the subscription
//!
//! Either cancellation scope ends the subscription silently.

use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Stream, TryStreamExt};
use tokio_util::sync::CancellationToken;

use super::frames::EventStreamReader;
use crate::application::ports::{CloseKind, Subscription};
use crate::infrastructure::client::stats::ConnectionCounters;
use crate::infrastructure::metrics::{self, Transport};
use crate::infrastructure::protocol::codec::{self, INTERNAL_ERROR};

const DATA_PREFIX: &str = "data:";
const EVENT_PREFIX: &str = "event:";
const COMMENT_PREFIX: char = ':';
const EVENT_COMPLETE: &str = "complete";
const EVENT_NEXT: &str = "next";

type BodyStream = Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>;

/// How the subscription ended.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Completed,
    Unsubscribed,
    Failed(String),
}

/// Handler for one SSE subscription.
pub struct SseConnectionHandler {
    body: EventStreamReader<BodyStream>,
    subscription: Subscription,
    engine: CancellationToken,
    counters: Arc<ConnectionCounters>,
}

impl SseConnectionHandler {
    /// Wrap an accepted streaming response.
    #[must_use]
    pub fn new(
        response: reqwest::Response,
        subscription: Subscription,
        engine: CancellationToken,
        counters: Arc<ConnectionCounters>,
    ) -> Self {
        counters.sse_opened();
        metrics::record_connection_opened(Transport::Sse);
        Self {
            body: EventStreamReader::new(Box::pin(response.bytes_stream().map_ok(Vec::from))),
            subscription,
            engine,
            counters,
        }
    }

    /// Deliver events until the stream ends or either scope is cancelled.
    pub async fn run(mut self) {
        let outcome = self.read_events().await;
        let updater = &self.subscription.updater;

        let kind = match outcome {
            Outcome::Completed => CloseKind::Completed,
            Outcome::Unsubscribed => CloseKind::Unsubscribed,
            Outcome::Failed(payload) => {
                updater.update(payload).await;
                CloseKind::Failed
            }
        };
        updater.close(kind).await;

        self.counters.subscription_removed();
        self.counters.sse_closed();
        metrics::record_connection_closed(Transport::Sse);
        tracing::info!(url = %self.subscription.options.url, outcome = kind.as_str(), "SSE subscription ended");
    }

    async fn read_events(&mut self) -> Outcome {
        loop {
            if self.is_cancelled() {
                return Outcome::Unsubscribed;
            }

            let event = tokio::select! {
                biased;

                () = self.subscription.cancel.cancelled() => return Outcome::Unsubscribed,
                () = self.engine.cancelled() => return Outcome::Unsubscribed,
                event = self.body.next_event() => event,
            };

            match event {
                Ok(Some(event)) => {
                    if let Some(outcome) =
                        process_event(&self.subscription, &self.engine, &event).await
                    {
                        return outcome;
                    }
                }
                Ok(None) => return Outcome::Completed,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read SSE event");
                    metrics::record_connection_error(Transport::Sse, "read");
                    return Outcome::Failed(INTERNAL_ERROR.to_string());
                }
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.subscription.is_cancelled() || self.engine.is_cancelled()
    }
}

/// Handle one event; `Some` ends the subscription.
async fn process_event(
    subscription: &Subscription,
    engine: &CancellationToken,
    event: &str,
) -> Option<Outcome> {
    for line in event.split(['\n', '\r']).filter(|line| !line.is_empty()) {
        if let Some(data) = line.strip_prefix(DATA_PREFIX) {
            let data = data.trim_start_matches([' ', '\t']);
            if data.is_empty() {
                continue;
            }
            if subscription.is_cancelled() || engine.is_cancelled() {
                return Some(Outcome::Unsubscribed);
            }
            subscription.updater.update(data.to_string()).await;
            metrics::record_message_delivered(Transport::Sse);
        } else if let Some(kind) = line.strip_prefix(EVENT_PREFIX) {
            match kind.trim() {
                EVENT_COMPLETE => return Some(Outcome::Completed),
                EVENT_NEXT => {}
                other => tracing::trace!(event = other, "Ignoring SSE event type"),
            }
        } else if line.starts_with(COMMENT_PREFIX) {
            tracing::trace!("SSE comment");
        } else if let Some(errors) = codec::errors_line(line) {
            return Some(Outcome::Failed(errors));
        }
    }
    None
}

impl std::fmt::Debug for SseConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseConnectionHandler")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

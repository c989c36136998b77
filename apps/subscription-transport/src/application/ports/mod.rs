//! Port Interfaces
//!
//! Defines the interfaces (ports) between the connection handlers and the
//! outside world, following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `SubscriptionUpdater`: Output sink of one subscriber
//! - `ConnectionInitHook`: Source of the `connection_init` payload
//!
//! ## Adapters
//!
//! - `ChannelUpdater`: `SubscriptionUpdater` backed by an mpsc channel

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::SubscriptionOptions;

// =============================================================================
// Subscription Updater
// =============================================================================

/// Why a subscription stopped receiving messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseKind {
    /// The upstream completed the subscription.
    Completed,
    /// The subscriber's own scope ended. Never preceded by an error payload.
    Unsubscribed,
    /// Terminal failure. An error envelope was delivered just before.
    Failed,
}

impl CloseKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Unsubscribed => "unsubscribed",
            Self::Failed => "failed",
        }
    }
}

/// Output sink of one subscriber.
///
/// `update` is called once per upstream message, in upstream order.
/// `close` is called exactly once; no `update` follows it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionUpdater: Send + Sync {
    /// Deliver a GraphQL response fragment or a normalized error envelope.
    async fn update(&self, payload: String);

    /// Signal that no more messages will arrive.
    async fn close(&self, kind: CloseKind);
}

// =============================================================================
// Connection Init Hook
// =============================================================================

/// Error returned by a [`ConnectionInitHook`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("connection init hook failed: {0}")]
pub struct InitHookError(pub String);

/// Supplies the `connection_init` payload for new WebSocket connections.
///
/// Called with the upstream URL and the static upgrade headers. Returning
/// `Ok(None)` sends `connection_init` without a payload.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionInitHook: Send + Sync {
    /// Build the payload for a new connection to `url`.
    ///
    /// # Errors
    ///
    /// Any error aborts the subscribe call before the handshake.
    fn connection_init_payload(
        &self,
        url: &str,
        header: &BTreeMap<String, Vec<String>>,
    ) -> Result<Option<Value>, InitHookError>;
}

// =============================================================================
// Subscription
// =============================================================================

/// One logical subscriber: its scope, its request, and its output sink.
#[derive(Clone)]
pub struct Subscription {
    /// Subscriber's request scope.
    pub cancel: CancellationToken,
    /// Request description.
    pub options: Arc<SubscriptionOptions>,
    /// Output sink.
    pub updater: Arc<dyn SubscriptionUpdater>,
}

impl Subscription {
    /// Bundle a subscriber.
    #[must_use]
    pub fn new(
        cancel: CancellationToken,
        options: Arc<SubscriptionOptions>,
        updater: Arc<dyn SubscriptionUpdater>,
    ) -> Self {
        Self {
            cancel,
            options,
            updater,
        }
    }

    /// Whether the subscriber's scope has ended.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("url", &self.options.url)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Channel Updater
// =============================================================================

/// Event delivered through a [`ChannelUpdater`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// One delivered message.
    Update(String),
    /// Terminal signal.
    Closed(CloseKind),
}

/// [`SubscriptionUpdater`] that forwards into a bounded mpsc channel.
///
/// A dropped receiver turns every call into a no-op.
#[derive(Debug, Clone)]
pub struct ChannelUpdater {
    tx: mpsc::Sender<SubscriptionEvent>,
}

impl ChannelUpdater {
    /// Create an updater and the receiving end of its channel.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SubscriptionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SubscriptionUpdater for ChannelUpdater {
    async fn update(&self, payload: String) {
        if self.tx.send(SubscriptionEvent::Update(payload)).await.is_err() {
            tracing::trace!("Subscriber receiver dropped, discarding update");
        }
    }

    async fn close(&self, kind: CloseKind) {
        if self.tx.send(SubscriptionEvent::Closed(kind)).await.is_err() {
            tracing::trace!(kind = kind.as_str(), "Subscriber receiver dropped, discarding close");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Subscription Client
//!
//! Single entry point for starting upstream subscriptions.
//!
//! # WebSocket
//!
//! The request is hashed; subscribers with equal hashes share one
//! connection. A live handler for the hash receives the subscriber on its
//! joiner queue. Otherwise a connection is dialled and acknowledged, then
//! registered and handed to a new handler task. The registry lock is never
//! held across the dial; if another caller registered the same hash first,
//! the fresh connection is closed and the subscriber joins the winner.
//!
//! # SSE
//!
//! Every subscriber gets a dedicated request and handler.

pub mod registry;
pub mod stats;

pub use registry::{EnqueueError, HandlerEntry, HandlerRegistry, Registration};
pub use stats::{ClientStats, ConnectionCounters};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::application::ports::{ConnectionInitHook, Subscription, SubscriptionUpdater};
use crate::domain::dedup::subscription_hash;
use crate::domain::subscription::{RequestScope, SubscriptionOptions};
use crate::infrastructure::config::TransportSettings;
use crate::infrastructure::metrics;
use crate::infrastructure::sse::{self, SseConnectionHandler, SseError};
use crate::infrastructure::websocket::{self, ConnectError, Connection, WsConnectionHandler};

// =============================================================================
// Error Type
// =============================================================================

/// Errors returned by [`SubscriptionClient::subscribe`].
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// The client has no transport for the requested mode.
    #[error("{0} transport is not configured")]
    TransportNotConfigured(&'static str),

    /// WebSocket dial or handshake failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// SSE request failed.
    #[error(transparent)]
    Sse(#[from] SseError),

    /// The subscriber's scope ended before it reached a handler.
    #[error("subscriber scope ended before the subscription started")]
    Cancelled,

    /// The client's engine scope has ended.
    #[error("subscription client is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Client
// =============================================================================

/// Opens and shares upstream subscription connections.
pub struct SubscriptionClient {
    websocket: Option<WebSocketConfig>,
    streaming_client: Option<reqwest::Client>,
    init_hook: Option<Arc<dyn ConnectionInitHook>>,
    engine: CancellationToken,
    settings: TransportSettings,
    registry: Arc<HandlerRegistry>,
    counters: Arc<ConnectionCounters>,
    next_connection_id: AtomicU64,
}

impl SubscriptionClient {
    /// Start building a client whose handlers live until `engine` is cancelled.
    #[must_use]
    pub fn builder(engine: CancellationToken) -> SubscriptionClientBuilder {
        SubscriptionClientBuilder::new(engine)
    }

    /// Start a subscription.
    ///
    /// Returns once the subscriber is attached to a handler; results then
    /// flow to `updater` until its `close` is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport for the requested mode is not
    /// configured, if the handshake or SSE request fails, or if the
    /// caller's scope ends first.
    pub async fn subscribe(
        &self,
        scope: &RequestScope,
        options: SubscriptionOptions,
        updater: Arc<dyn SubscriptionUpdater>,
    ) -> Result<(), SubscribeError> {
        if self.engine.is_cancelled() {
            return Err(SubscribeError::ShuttingDown);
        }

        let use_sse = options.use_sse;
        let subscription = Subscription::new(scope.cancel.clone(), Arc::new(options), updater);

        if use_sse {
            self.subscribe_sse(subscription).await
        } else {
            self.subscribe_ws(scope, subscription).await
        }
    }

    /// Live connection and subscriber counts.
    #[must_use]
    pub fn stats(&self) -> ClientStats {
        self.counters.snapshot()
    }

    /// Number of registered WebSocket handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.registry.len()
    }

    /// Tear down every handler; each attached subscriber receives an error.
    pub fn shutdown(&self) {
        self.engine.cancel();
    }

    async fn subscribe_ws(
        &self,
        scope: &RequestScope,
        mut subscription: Subscription,
    ) -> Result<(), SubscribeError> {
        let config = self
            .websocket
            .ok_or(SubscribeError::TransportNotConfigured("WebSocket"))?;
        let hash = subscription_hash(&subscription.options, &scope.headers);

        loop {
            if let Some(entry) = self.registry.lookup(hash) {
                self.counters.subscription_added();
                match entry.enqueue(subscription, &scope.cancel).await {
                    Ok(()) => {
                        metrics::record_handler_reuse();
                        tracing::debug!(hash, connection_id = entry.connection_id, "Joined existing connection");
                        return Ok(());
                    }
                    Err(EnqueueError::Cancelled) => {
                        self.counters.subscription_removed();
                        return Err(SubscribeError::Cancelled);
                    }
                    Err(EnqueueError::Closed(returned)) => {
                        self.counters.subscription_removed();
                        tracing::debug!(hash, connection_id = entry.connection_id, "Handler is shutting down");
                        subscription = returned;
                    }
                }
            }

            let connection = self.dial(&subscription, config).await?;
            let (joiner_tx, joiner_rx) = mpsc::channel(self.settings.join_queue_capacity.max(1));
            let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

            match self
                .registry
                .register(hash, HandlerEntry::new(connection_id, joiner_tx))
            {
                Registration::Registered => {
                    self.spawn_ws_handler(connection, joiner_rx, subscription, connection_id, hash);
                    return Ok(());
                }
                Registration::Occupied(entry) => {
                    tracing::debug!(hash, connection_id = entry.connection_id, "Lost registration race, joining winner");
                    connection.close().await;
                }
            }
        }
    }

    async fn dial(
        &self,
        subscription: &Subscription,
        config: WebSocketConfig,
    ) -> Result<Connection, SubscribeError> {
        let options = &subscription.options;

        let connected = match self.init_payload(options) {
            Ok(init_payload) => tokio::select! {
                biased;

                () = subscription.cancel.cancelled() => return Err(SubscribeError::Cancelled),
                () = self.engine.cancelled() => return Err(SubscribeError::ShuttingDown),
                result = websocket::connect(options, init_payload, config, self.settings.ack_timeout) => result,
            },
            Err(e) => Err(e),
        };

        connected.map_err(|e| {
            metrics::record_handshake_failure(e.error_type());
            tracing::warn!(url = %options.url, error = %e, "WebSocket handshake failed");
            SubscribeError::from(e)
        })
    }

    fn init_payload(&self, options: &SubscriptionOptions) -> Result<Option<Value>, ConnectError> {
        match &self.init_hook {
            Some(hook) => Ok(hook.connection_init_payload(&options.url, &options.header)?),
            None => Ok(None),
        }
    }

    fn spawn_ws_handler(
        &self,
        connection: Connection,
        joiner: mpsc::Receiver<Subscription>,
        first: Subscription,
        connection_id: u64,
        hash: u64,
    ) {
        let handler = WsConnectionHandler::new(
            connection,
            joiner,
            self.engine.clone(),
            &self.settings,
            Arc::clone(&self.counters),
            connection_id,
            hash,
        );
        self.counters.subscription_added();

        let registry = Arc::clone(&self.registry);
        let span = tracing::info_span!("ws_handler", connection_id, hash, url = %first.options.url);
        tokio::spawn(
            async move {
                handler.run(first).await;
                registry.remove(hash, connection_id);
            }
            .instrument(span),
        );
    }

    async fn subscribe_sse(&self, subscription: Subscription) -> Result<(), SubscribeError> {
        let client = self
            .streaming_client
            .as_ref()
            .ok_or(SubscribeError::TransportNotConfigured("SSE"))?;

        let opened = tokio::select! {
            biased;

            () = subscription.cancel.cancelled() => return Err(SubscribeError::Cancelled),
            () = self.engine.cancelled() => return Err(SubscribeError::ShuttingDown),
            result = sse::open(client, &subscription.options) => result,
        };

        let response = opened.map_err(|e| {
            metrics::record_handshake_failure(e.error_type());
            tracing::warn!(url = %subscription.options.url, error = %e, "SSE request failed");
            e
        })?;

        let span = tracing::info_span!("sse_handler", url = %subscription.options.url);
        self.counters.subscription_added();
        let handler = SseConnectionHandler::new(
            response,
            subscription,
            self.engine.clone(),
            Arc::clone(&self.counters),
        );
        tokio::spawn(handler.run().instrument(span));
        Ok(())
    }
}

impl std::fmt::Debug for SubscriptionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionClient")
            .field("websocket", &self.websocket.is_some())
            .field("sse", &self.streaming_client.is_some())
            .field("init_hook", &self.init_hook.is_some())
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SubscriptionClient`].
pub struct SubscriptionClientBuilder {
    engine: CancellationToken,
    websocket: Option<WebSocketConfig>,
    streaming_client: Option<reqwest::Client>,
    init_hook: Option<Arc<dyn ConnectionInitHook>>,
    settings: TransportSettings,
}

impl SubscriptionClientBuilder {
    fn new(engine: CancellationToken) -> Self {
        Self {
            engine,
            websocket: None,
            streaming_client: None,
            init_hook: None,
            settings: TransportSettings::default(),
        }
    }

    /// Enable WebSocket subscriptions with the default socket configuration.
    #[must_use]
    pub fn with_websocket(self) -> Self {
        self.with_websocket_config(WebSocketConfig::default())
    }

    /// Enable WebSocket subscriptions with `config`.
    #[must_use]
    pub fn with_websocket_config(mut self, config: WebSocketConfig) -> Self {
        self.websocket = Some(config);
        self
    }

    /// Enable SSE subscriptions over `client`.
    #[must_use]
    pub fn with_streaming_client(mut self, client: reqwest::Client) -> Self {
        self.streaming_client = Some(client);
        self
    }

    /// Build `connection_init` payloads with `hook`.
    #[must_use]
    pub fn with_connection_init_hook(mut self, hook: Arc<dyn ConnectionInitHook>) -> Self {
        self.init_hook = Some(hook);
        self
    }

    /// Override handler tuning.
    #[must_use]
    pub fn with_settings(mut self, settings: TransportSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the client.
    #[must_use]
    pub fn build(self) -> SubscriptionClient {
        SubscriptionClient {
            websocket: self.websocket,
            streaming_client: self.streaming_client,
            init_hook: self.init_hook,
            engine: self.engine,
            settings: self.settings,
            registry: Arc::new(HandlerRegistry::new()),
            counters: Arc::new(ConnectionCounters::default()),
            next_connection_id: AtomicU64::new(1),
        }
    }
}

impl std::fmt::Debug for SubscriptionClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionClientBuilder")
            .field("websocket", &self.websocket.is_some())
            .field("sse", &self.streaming_client.is_some())
            .field("init_hook", &self.init_hook.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

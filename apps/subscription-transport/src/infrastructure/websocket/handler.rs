//! WebSocket Connection Handler
//!
//! Owns one acknowledged connection and serves every subscriber that
//! hashed to it. A single event loop touches the subscription table, so no
//! locking happens inside a handler. The loop waits on:
//!
//! 1. the engine scope (teardown of everything),
//! 2. the liveness tick (sweep of subscribers whose scope ended),
//! 3. the joiner queue (new subscribers for this connection),
//! 4. frames from the reader task.
//!
//! The handler exits when a tick finds no subscribers left, on any fatal
//! error, or when the engine scope ends. Every subscriber still attached at
//! exit receives the error envelope and `close(Failed)`; an idle exit has
//! nobody left to notify.
//!
//! Handing anything to a subscriber is bounded by the delivery timeout and
//! abandoned once that subscriber's scope ends, so one stalled subscriber
//! cannot hold up its siblings. A subscriber that stops draining its
//! updater may therefore miss messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::dial::{Connection, WsStream};
use super::reader::{FrameResult, spawn_reader};
use super::{Protocol, ServerEvent};
use crate::application::ports::{CloseKind, Subscription};
use crate::infrastructure::client::stats::ConnectionCounters;
use crate::infrastructure::config::TransportSettings;
use crate::infrastructure::metrics::{self, Transport};
use crate::infrastructure::protocol::codec::{self, CONNECTION_ERROR, INTERNAL_ERROR};
use crate::infrastructure::protocol::messages::ServerMessage;

/// Bound on best-effort writes during shutdown.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shortest liveness tick; `tokio::time::interval` rejects a zero period.
const MIN_LIVENESS_INTERVAL: Duration = Duration::from_millis(1);

type WsSink = SplitSink<WsStream, Message>;

/// Why the event loop stopped.
#[derive(Debug)]
enum Exit {
    /// No subscribers left at a liveness tick.
    Idle,
    /// Connection-fatal condition; `payload` goes to every subscriber.
    Fatal {
        payload: String,
        reason: &'static str,
    },
}

impl Exit {
    fn fatal(payload: impl Into<String>, reason: &'static str) -> Self {
        Self::Fatal {
            payload: payload.into(),
            reason,
        }
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Handler for one multiplexed WebSocket connection.
pub struct WsConnectionHandler {
    connection: Connection,
    joiner: mpsc::Receiver<Subscription>,
    engine: CancellationToken,
    liveness_interval: Duration,
    delivery_timeout: Duration,
    read_queue_capacity: usize,
    counters: Arc<ConnectionCounters>,
    connection_id: u64,
    hash: u64,
}

impl WsConnectionHandler {
    /// Wrap an acknowledged connection.
    ///
    /// The connection counts as live from here until [`run`](Self::run)
    /// returns.
    #[must_use]
    pub fn new(
        connection: Connection,
        joiner: mpsc::Receiver<Subscription>,
        engine: CancellationToken,
        settings: &TransportSettings,
        counters: Arc<ConnectionCounters>,
        connection_id: u64,
        hash: u64,
    ) -> Self {
        counters.ws_opened();
        metrics::record_connection_opened(Transport::from(connection.protocol));
        Self {
            connection,
            joiner,
            engine,
            liveness_interval: settings.liveness_interval.max(MIN_LIVENESS_INTERVAL),
            delivery_timeout: settings.delivery_timeout,
            read_queue_capacity: settings.read_queue_capacity.max(1),
            counters,
            connection_id,
            hash,
        }
    }

    /// Serve `first` and every later joiner until the connection ends.
    pub async fn run(self, first: Subscription) {
        let Self {
            connection,
            joiner,
            engine,
            liveness_interval,
            delivery_timeout,
            read_queue_capacity,
            counters,
            connection_id,
            hash,
        } = self;

        let protocol = connection.protocol;
        let (sink, stream) = connection.stream.split();
        let (frame_tx, frames) = mpsc::channel(read_queue_capacity);
        let reader_cancel = CancellationToken::new();
        let reader = spawn_reader(stream, frame_tx, reader_cancel.clone());

        tracing::info!(connection_id, hash, protocol = %protocol, "Connection handler started");

        let mut event_loop = EventLoop {
            protocol,
            sink,
            frames,
            joiner,
            subscriptions: HashMap::new(),
            next_id: 0,
            accepting: true,
            engine,
            delivery_timeout,
            counters: Arc::clone(&counters),
        };

        let exit = match event_loop.subscribe(first).await {
            Ok(()) => event_loop.run(liveness_interval).await,
            Err(exit) => exit,
        };

        event_loop.shutdown(&exit).await;
        reader_cancel.cancel();
        if let Err(e) = reader.await {
            tracing::debug!(connection_id, error = %e, "Reader task ended abnormally");
        }

        counters.ws_closed();
        metrics::record_connection_closed(Transport::from(protocol));

        match exit {
            Exit::Idle => {
                tracing::info!(connection_id, hash, "Connection handler closed, no subscribers left");
            }
            Exit::Fatal { reason, .. } => {
                metrics::record_connection_error(Transport::from(protocol), reason);
                tracing::info!(connection_id, hash, reason, "Connection handler closed");
            }
        }
    }
}

impl std::fmt::Debug for WsConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnectionHandler")
            .field("connection_id", &self.connection_id)
            .field("hash", &self.hash)
            .field("protocol", &self.connection.protocol)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Event Loop
// =============================================================================

struct EventLoop {
    protocol: Protocol,
    sink: WsSink,
    frames: mpsc::Receiver<FrameResult>,
    joiner: mpsc::Receiver<Subscription>,
    subscriptions: HashMap<String, Subscription>,
    next_id: u64,
    accepting: bool,
    engine: CancellationToken,
    delivery_timeout: Duration,
    counters: Arc<ConnectionCounters>,
}

impl EventLoop {
    async fn run(&mut self, liveness: Duration) -> Exit {
        let mut ticker = tokio::time::interval_at(Instant::now() + liveness, liveness);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let engine = self.engine.clone();

        loop {
            let step = tokio::select! {
                biased;

                () = engine.cancelled() => {
                    Err(Exit::fatal(codec::error_envelope("subscription client shut down"), "engine_cancelled"))
                }
                _ = ticker.tick() => self.on_tick().await,
                joined = self.joiner.recv(), if self.accepting => match joined {
                    Some(subscription) => self.subscribe(subscription).await,
                    None => {
                        self.accepting = false;
                        Ok(())
                    }
                },
                frame = self.frames.recv() => match frame {
                    Some(Ok(text)) => self.on_frame(&text).await,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Upstream connection lost");
                        Err(Exit::fatal(codec::error_envelope(&e), "read"))
                    }
                    None => Err(Exit::fatal(INTERNAL_ERROR, "read")),
                },
            };

            if let Err(exit) = step {
                return exit;
            }
        }
    }

    /// Sweep cancelled subscribers, then decide whether the connection is idle.
    async fn on_tick(&mut self) -> Result<(), Exit> {
        let cancelled: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.is_cancelled())
            .map(|(id, _)| id.clone())
            .collect();

        for id in cancelled {
            self.unsubscribe(&id).await?;
        }

        if !self.subscriptions.is_empty() {
            return Ok(());
        }

        // Stop taking joiners, but serve any that were already queued.
        self.joiner.close();
        self.accepting = false;
        while let Ok(subscription) = self.joiner.try_recv() {
            self.subscribe(subscription).await?;
        }

        if self.subscriptions.is_empty() {
            Err(Exit::Idle)
        } else {
            Ok(())
        }
    }

    async fn subscribe(&mut self, subscription: Subscription) -> Result<(), Exit> {
        if subscription.is_cancelled() {
            tracing::debug!("Subscriber cancelled before start");
            self.close(&subscription, CloseKind::Unsubscribed).await;
            return Ok(());
        }

        self.next_id += 1;
        let id = self.next_id.to_string();

        let message = match self
            .protocol
            .subscribe_message(&id, &subscription.options.body)
        {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode subscribe message");
                self.fail(&subscription, &codec::error_envelope(&e)).await;
                return Ok(());
            }
        };

        self.subscriptions.insert(id.clone(), subscription);
        self.send(message).await?;
        tracing::debug!(subscription_id = %id, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&mut self, id: &str) -> Result<(), Exit> {
        let Some(subscription) = self.subscriptions.remove(id) else {
            return Ok(());
        };

        let sent = match self.protocol.unsubscribe_message(id) {
            Ok(message) => self.send(message).await,
            Err(e) => {
                tracing::warn!(subscription_id = %id, error = %e, "Failed to encode unsubscribe message");
                Ok(())
            }
        };

        tracing::debug!(subscription_id = %id, "Unsubscribed");
        self.close(&subscription, CloseKind::Unsubscribed).await;
        sent
    }

    async fn on_frame(&mut self, text: &str) -> Result<(), Exit> {
        let message = match codec::decode(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring undecodable upstream message");
                return Ok(());
            }
        };

        match self.protocol.classify(&message.kind) {
            ServerEvent::Data => {
                let Some(subscription) = self.lookup(&message) else {
                    return Ok(());
                };
                let payload = message.payload_text().unwrap_or("null").to_string();
                if self.deliver(subscription, payload).await {
                    metrics::record_message_delivered(Transport::from(self.protocol));
                }
            }
            ServerEvent::Complete => {
                let removed = message
                    .id
                    .as_deref()
                    .and_then(|id| self.subscriptions.remove(id));
                if let Some(subscription) = removed {
                    tracing::debug!(subscription_id = ?message.id, "Completed by upstream");
                    self.close(&subscription, CloseKind::Completed).await;
                }
            }
            ServerEvent::Error => {
                let Some(subscription) = self.lookup(&message) else {
                    return Ok(());
                };
                let payload = codec::normalize_error_payload(message.payload.as_deref());
                self.deliver(subscription, payload).await;
            }
            ServerEvent::ConnectionError => {
                tracing::warn!(payload = ?message.payload_text(), "Upstream sent connection_error");
                return Err(Exit::fatal(CONNECTION_ERROR, "connection_error"));
            }
            ServerEvent::Ping => {
                let pong = super::transport::pong_message()
                    .map_err(|e| Exit::fatal(codec::error_envelope(&e), "encode"))?;
                self.send(pong).await?;
                tracing::trace!("Answered ping");
            }
            ServerEvent::KeepAlive => {
                tracing::trace!(kind = %message.kind, "Keep-alive");
            }
            ServerEvent::Mismatch => {
                tracing::warn!(
                    kind = %message.kind,
                    protocol = %self.protocol,
                    "Message belongs to the other sub-protocol"
                );
                return Err(Exit::fatal(INTERNAL_ERROR, "protocol_mismatch"));
            }
            ServerEvent::Unknown => {
                tracing::warn!(kind = %message.kind, "Unknown message type");
            }
        }

        Ok(())
    }

    fn lookup(&self, message: &ServerMessage) -> Option<&Subscription> {
        let subscription = message
            .id
            .as_deref()
            .and_then(|id| self.subscriptions.get(id));
        if subscription.is_none() {
            tracing::trace!(subscription_id = ?message.id, kind = %message.kind, "No subscriber for message");
        }
        subscription
    }

    async fn send(&mut self, text: String) -> Result<(), Exit> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Write to upstream failed");
                Exit::fatal(codec::error_envelope(&e), "write")
            })
    }

    /// Hand `payload` to one subscriber; `false` when it was dropped.
    async fn deliver(&self, subscription: &Subscription, payload: String) -> bool {
        if subscription.is_cancelled() {
            tracing::trace!("Subscriber cancelled, dropping message");
            return false;
        }

        let update = tokio::time::timeout(self.delivery_timeout, subscription.updater.update(payload));
        tokio::select! {
            biased;

            () = subscription.cancel.cancelled() => false,
            () = self.engine.cancelled() => false,
            delivered = update => {
                if delivered.is_err() {
                    tracing::warn!(
                        timeout_ms = self.delivery_timeout.as_millis(),
                        "Subscriber did not accept message in time, dropping it"
                    );
                }
                delivered.is_ok()
            }
        }
    }

    /// Send the terminal signal while the loop is running.
    async fn close(&self, subscription: &Subscription, kind: CloseKind) {
        self.counters.subscription_removed();
        let close = tokio::time::timeout(self.delivery_timeout, subscription.updater.close(kind));
        tokio::select! {
            biased;

            () = self.engine.cancelled() => {
                tracing::debug!(kind = kind.as_str(), "Engine cancelled before subscriber took close");
            }
            closed = close => {
                if closed.is_err() {
                    tracing::warn!(kind = kind.as_str(), "Subscriber did not accept close in time");
                }
            }
        }
    }

    /// Deliver `payload` and `close(Failed)`, or a silent `close(Unsubscribed)`
    /// when the subscriber's scope already ended. Bounded, but not abandoned
    /// on engine cancellation.
    async fn fail(&self, subscription: &Subscription, payload: &str) {
        self.counters.subscription_removed();

        let kind = if subscription.is_cancelled() {
            CloseKind::Unsubscribed
        } else {
            let update = subscription.updater.update(payload.to_string());
            if tokio::time::timeout(self.delivery_timeout, update).await.is_err() {
                tracing::warn!("Subscriber did not accept error in time");
            }
            CloseKind::Failed
        };

        let close = subscription.updater.close(kind);
        if tokio::time::timeout(self.delivery_timeout, close).await.is_err() {
            tracing::warn!(kind = kind.as_str(), "Subscriber did not accept close in time");
        }
    }

    /// Notify every remaining and queued subscriber, then close the socket.
    async fn shutdown(&mut self, exit: &Exit) {
        self.joiner.close();
        self.accepting = false;

        let payload = match exit {
            Exit::Idle => INTERNAL_ERROR,
            Exit::Fatal { payload, .. } => payload.as_str(),
        };

        let mut remaining: Vec<(String, Subscription)> = self.subscriptions.drain().collect();
        remaining.sort_by_key(|(id, _)| id.parse::<u64>().unwrap_or(u64::MAX));

        for (id, subscription) in remaining {
            if let Ok(message) = self.protocol.unsubscribe_message(&id) {
                let write = self.sink.send(Message::Text(message.into()));
                if !matches!(tokio::time::timeout(WRITE_TIMEOUT, write).await, Ok(Ok(()))) {
                    tracing::trace!(subscription_id = %id, "Unsubscribe during shutdown not delivered");
                }
            }
            self.fail(&subscription, payload).await;
        }

        while let Ok(subscription) = self.joiner.try_recv() {
            self.fail(&subscription, payload).await;
        }

        match tokio::time::timeout(WRITE_TIMEOUT, self.sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Error closing connection"),
            Err(_) => tracing::debug!("Timed out closing connection"),
        }
    }
}

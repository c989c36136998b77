//! Handler Registry
//!
//! Maps a dedup hash to the joiner queue of the WebSocket handler serving
//! it. The lock is held only for lookup or insert, never across I/O. An
//! entry is removed only by the handler task that owns it, matched by
//! connection id, so a replacement registered after a stale handler
//! started shutting down is never removed by the old task.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio_util::sync::CancellationToken;

use crate::application::ports::Subscription;

/// Handle to a running handler's joiner queue.
#[derive(Debug, Clone)]
pub struct HandlerEntry {
    /// Id of the connection owning this entry.
    pub connection_id: u64,
    joiner: mpsc::Sender<Subscription>,
}

/// Why a subscriber could not be handed to a handler.
#[derive(Debug)]
pub enum EnqueueError {
    /// The handler stopped accepting; the subscriber is returned.
    Closed(Subscription),
    /// The caller's scope ended while waiting for queue capacity.
    Cancelled,
}

impl HandlerEntry {
    /// Create an entry for a new handler.
    #[must_use]
    pub const fn new(connection_id: u64, joiner: mpsc::Sender<Subscription>) -> Self {
        Self {
            connection_id,
            joiner,
        }
    }

    /// Whether the handler has stopped accepting joiners.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.joiner.is_closed()
    }

    /// Hand `subscription` to the handler, racing the caller's scope.
    ///
    /// # Errors
    ///
    /// Returns the subscriber back if the handler is shutting down, or
    /// `Cancelled` if `cancel` fires first.
    pub async fn enqueue(
        &self,
        subscription: Subscription,
        cancel: &CancellationToken,
    ) -> Result<(), EnqueueError> {
        tokio::select! {
            biased;

            () = cancel.cancelled() => Err(EnqueueError::Cancelled),
            sent = self.joiner.send(subscription) => {
                sent.map_err(|SendError(subscription)| EnqueueError::Closed(subscription))
            }
        }
    }
}

/// Outcome of [`HandlerRegistry::register`].
#[derive(Debug)]
pub enum Registration {
    /// The entry is now registered.
    Registered,
    /// A live handler for the hash already exists.
    Occupied(HandlerEntry),
}

/// Hash → handler map shared by every `subscribe` call.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<u64, HandlerEntry>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `hash`, if one is registered.
    #[must_use]
    pub fn lookup(&self, hash: u64) -> Option<HandlerEntry> {
        self.handlers.lock().get(&hash).cloned()
    }

    /// Register `entry` unless a live handler already serves `hash`.
    ///
    /// An entry whose handler stopped accepting is replaced.
    pub fn register(&self, hash: u64, entry: HandlerEntry) -> Registration {
        match self.handlers.lock().entry(hash) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_closed() {
                    occupied.insert(entry);
                    Registration::Registered
                } else {
                    Registration::Occupied(occupied.get().clone())
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Registration::Registered
            }
        }
    }

    /// Remove the entry for `hash` if it still belongs to `connection_id`.
    pub fn remove(&self, hash: u64, connection_id: u64) -> bool {
        let mut handlers = self.handlers.lock();
        if handlers
            .get(&hash)
            .is_some_and(|entry| entry.connection_id == connection_id)
        {
            handlers.remove(&hash);
            true
        } else {
            false
        }
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::application::ports::ChannelUpdater;
    use crate::domain::subscription::SubscriptionOptions;

    fn subscription() -> Subscription {
        let (updater, _rx) = ChannelUpdater::channel(1);
        Subscription::new(
            CancellationToken::new(),
            Arc::new(SubscriptionOptions::default()),
            Arc::new(updater),
        )
    }

    #[test]
    fn register_then_lookup() {
        let registry = HandlerRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            registry.register(7, HandlerEntry::new(1, tx)),
            Registration::Registered
        ));
        assert_eq!(registry.lookup(7).unwrap().connection_id, 1);
        assert!(registry.lookup(8).is_none());
    }

    #[test]
    fn live_entry_is_not_replaced() {
        let registry = HandlerRegistry::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        registry.register(7, HandlerEntry::new(1, tx1));

        match registry.register(7, HandlerEntry::new(2, tx2)) {
            Registration::Occupied(entry) => assert_eq!(entry.connection_id, 1),
            Registration::Registered => panic!("live entry replaced"),
        }
    }

    #[test]
    fn closed_entry_is_replaced() {
        let registry = HandlerRegistry::new();
        let (tx1, rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        registry.register(7, HandlerEntry::new(1, tx1));
        drop(rx1);

        assert!(matches!(
            registry.register(7, HandlerEntry::new(2, tx2)),
            Registration::Registered
        ));
        assert_eq!(registry.lookup(7).unwrap().connection_id, 2);
    }

    #[test]
    fn remove_requires_matching_connection() {
        let registry = HandlerRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.register(7, HandlerEntry::new(2, tx));

        assert!(!registry.remove(7, 1));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(7, 2));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn enqueue_to_closed_handler_returns_subscriber() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let entry = HandlerEntry::new(1, tx);
        let result = entry.enqueue(subscription(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(EnqueueError::Closed(_))));
    }

    #[tokio::test]
    async fn enqueue_to_full_queue_honours_cancellation() {
        let (tx, _rx) = mpsc::channel(1);
        let entry = HandlerEntry::new(1, tx);
        let cancel = CancellationToken::new();
        entry.enqueue(subscription(), &cancel).await.unwrap();

        cancel.cancel();
        let result = entry.enqueue(subscription(), &cancel).await;
        assert!(matches!(result, Err(EnqueueError::Cancelled)));
    }
}

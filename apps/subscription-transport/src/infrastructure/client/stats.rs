//! Live connection and subscriber counts.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters shared between the client and its handler tasks.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    ws_connections: AtomicUsize,
    sse_connections: AtomicUsize,
    subscriptions: AtomicUsize,
}

impl ConnectionCounters {
    /// A WebSocket handler started.
    pub fn ws_opened(&self) {
        self.ws_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// A WebSocket handler exited.
    pub fn ws_closed(&self) {
        self.ws_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// An SSE handler started.
    pub fn sse_opened(&self) {
        self.sse_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// An SSE handler exited.
    pub fn sse_closed(&self) {
        self.sse_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// A subscriber was attached to a handler.
    pub fn subscription_added(&self) {
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    /// A subscriber was closed.
    pub fn subscription_removed(&self) {
        self.subscriptions.fetch_sub(1, Ordering::Relaxed);
    }

    /// Snapshot of the current counts.
    #[must_use]
    pub fn snapshot(&self) -> ClientStats {
        ClientStats {
            ws_connections: self.ws_connections.load(Ordering::Relaxed),
            sse_connections: self.sse_connections.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about live upstream connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Number of live WebSocket handlers.
    pub ws_connections: usize,
    /// Number of live SSE handlers.
    pub sse_connections: usize,
    /// Number of subscribers attached to a handler and not yet closed.
    pub subscriptions: usize,
}

impl ClientStats {
    /// Get total number of live upstream connections.
    #[must_use]
    pub const fn total_connections(&self) -> usize {
        self.ws_connections + self.sse_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_open_and_close() {
        let counters = ConnectionCounters::default();
        counters.ws_opened();
        counters.ws_opened();
        counters.sse_opened();
        counters.subscription_added();
        counters.ws_closed();

        let stats = counters.snapshot();
        assert_eq!(stats.ws_connections, 1);
        assert_eq!(stats.sse_connections, 1);
        assert_eq!(stats.subscriptions, 1);
        assert_eq!(stats.total_connections(), 2);
    }

    #[test]
    fn default_stats_are_empty() {
        assert_eq!(ConnectionCounters::default().snapshot(), ClientStats::default());
    }
}

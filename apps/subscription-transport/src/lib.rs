#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Subscription Transport - GraphQL Subscription Multiplexer
//!
//! Opens, shares, and tears down long-lived connections to upstream GraphQL
//! subgraphs serving `subscription` operations. Many logical subscriptions
//! are multiplexed over a small number of physical connections, deduplicated
//! by a content hash of the request.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Request description and connection identity
//!   - `subscription`: Options, GraphQL body, sub-protocol selector, request scope
//!   - `dedup`: Streaming hash deciding which requests share a connection
//!
//! - **Application**: Port definitions
//!   - `ports`: Subscriber output sink, connection-init hook
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `protocol`: Wire envelopes and error normalization
//!   - `websocket`: graphql-ws and graphql-transport-ws connection handlers
//!   - `sse`: Server-Sent-Events connection handler
//!   - `client`: Subscription client and handler registry
//!   - `config`, `telemetry`, `metrics`: Ambient concerns
//!
//! # Data Flow
//!
//! ```text
//! Subscribe ──► hash ──► registry ──┬──► existing WS handler ──► subscriber queue
//!                                   ├──► new WS handler (dial + ack)
//!                                   └──► dedicated SSE handler
//!
//! upstream frame ──► read task ──► handler event loop ──► updater(id)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Request description and connection identity.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::dedup::subscription_hash;
pub use domain::subscription::{
    GraphQLBody, RequestScope, SubscriptionOptions, UnknownSubProtocol, WsSubProtocol,
};

// Ports
pub use application::ports::{
    ChannelUpdater, CloseKind, ConnectionInitHook, InitHookError, Subscription,
    SubscriptionEvent, SubscriptionUpdater,
};

// Client
pub use infrastructure::client::{
    ClientStats, SubscribeError, SubscriptionClient, SubscriptionClientBuilder,
};

// Config
pub use infrastructure::config::{ConfigError, TransportSettings, UpstreamSettings};

// Adapter errors
pub use infrastructure::sse::SseError;
pub use infrastructure::websocket::ConnectError;

// Metrics
pub use infrastructure::metrics::{Transport as MetricsTransport, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};

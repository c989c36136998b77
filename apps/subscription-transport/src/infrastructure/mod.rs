//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete transports (WebSocket, SSE), the subscription client that
//! multiplexes onto them, and ambient concerns.

/// Wire envelopes shared by the WebSocket sub-protocols.
pub mod protocol;

/// WebSocket connection handlers (graphql-ws, graphql-transport-ws).
pub mod websocket;

/// Server-Sent-Events connection handler.
pub mod sse;

/// Subscription client and handler registry.
pub mod client;

/// Configuration loaded from the environment.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;

//! Domain Layer - Request description and connection identity.
//!
//! Types here describe what a subscriber asked for and decide which
//! requests may share one upstream connection. Nothing in this layer
//! performs I/O.

/// Subscription request types (options, body, sub-protocol, scope).
pub mod subscription;

/// Connection deduplication hash.
pub mod dedup;

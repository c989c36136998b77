//! Application Layer - Port definitions.
//!
//! Contracts between the connection handlers and the code that consumes
//! subscription results.

/// Port interfaces for subscribers and connection initialisation.
pub mod ports;

//! Configuration Module
//!
//! Transport tuning and demo upstream settings, loaded from environment
//! variables.

mod settings;

pub use settings::{ConfigError, TransportSettings, UpstreamSettings};

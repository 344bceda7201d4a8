//! Common types for weft: errors, configuration, telemetry, metrics and leader election

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod leader_election;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default lease name for the reconciler leader election
pub const DEFAULT_LEASE_NAME: &str = "weft-reconciler-leader";

/// Default namespace holding the leader lease
pub const DEFAULT_LEASE_NAMESPACE: &str = "weft-system";

//! weft operator: leader-elected reconciler process

#![deny(missing_docs)]

/// Leader-gated lifecycle of the reconciler and watcher
pub mod coordinator;
/// Signal handling and bounded-grace shutdown
pub mod shutdown;
/// Assembling workers and watchers from configuration
pub mod wiring;

pub use coordinator::{LeaderCoordinator, TermEnd};
pub use shutdown::{run_with_grace, shutdown_signal, ShutdownOutcome};
pub use wiring::{local_subsystems, SubsystemBuilder, Subsystems};

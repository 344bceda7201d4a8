//! Error types for the weft reconciler
//!
//! Errors are structured with fields to aid debugging in production. Most
//! variants carry the resource kind and entity ID they concern so a log line
//! is enough to locate the affected record.
//!
//! The taxonomy drives escalation:
//! - benign races (`NotFound`, `SpecWasTouched`) are suppressed by the status push
//! - per-entity failures (`Hash`, action errors) are isolated and logged
//! - listing failures (`Storage`, `Runtime`) abort one reconciliation tick
//! - setup failures (`Registration`, `Config`, `LeaderElection`) are fatal

use thiserror::Error;

use crate::leader_election::LeaderElectionError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for weft operations
#[derive(Debug, Error)]
pub enum Error {
    /// Entity is absent in storage or runtime at read time
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Resource kind (training, deployment, ...)
        kind: String,
        /// Entity ID
        id: String,
    },

    /// Optimistic-concurrency conflict: the stored spec changed underneath us
    #[error("spec of {kind} '{id}' was touched concurrently")]
    SpecWasTouched {
        /// Resource kind
        kind: String,
        /// Entity ID
        id: String,
    },

    /// Runtime object was built from a spec that storage no longer holds
    #[error("runtime {kind} '{id}' reflects a stale spec, status not propagated")]
    StaleSpec {
        /// Resource kind
        kind: String,
        /// Entity ID
        id: String,
    },

    /// Content fingerprint could not be computed
    #[error("failed to hash '{id}': {message}")]
    Hash {
        /// Entity ID
        id: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Durable store read or write failed
    #[error("storage error [{kind}]: {message}")]
    Storage {
        /// Resource kind
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// Orchestration runtime read or write failed
    #[error("runtime error [{kind}]: {message}")]
    Runtime {
        /// Resource kind
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// Subscribing to runtime updates failed
    #[error("registration error [{kind}]: {message}")]
    Registration {
        /// Resource kind
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Leader election failure
    #[error("leader election error: {0}")]
    LeaderElection(#[from] LeaderElectionError),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "worker", "supervisor")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for an entity
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create an optimistic-concurrency conflict error for an entity
    pub fn spec_was_touched(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::SpecWasTouched {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a stale-spec error for an entity
    pub fn stale_spec(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::StaleSpec {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a hash-computation error for an entity
    pub fn hash(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Hash {
            id: id.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a storage error for a resource kind
    pub fn storage(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Storage {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a runtime error for a resource kind
    pub fn runtime(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Runtime {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a registration error for a resource kind
    pub fn registration(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registration {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    ///
    /// For simple internal errors without specific context.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True if the entity was absent at read time
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for races the status push tolerates silently
    ///
    /// A row deleted or edited between the runtime event and the status write
    /// is picked up again by the next reconciliation tick.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Error::NotFound { .. } | Error::SpecWasTouched { .. })
    }

    /// Check if this error is retryable
    ///
    /// Configuration, serialization and registration errors need a fix or a
    /// restart. Everything else is expected to clear on a later tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::SpecWasTouched { .. } => true,
            Error::StaleSpec { .. } => true,
            Error::Hash { .. } => false,
            Error::Serialization { .. } => false,
            Error::Storage { .. } => true,
            Error::Runtime { .. } => true,
            Error::Registration { .. } => false,
            Error::Config { .. } => false,
            Error::LeaderElection(e) => e.is_retryable(),
            Error::Internal { .. } => true,
        }
    }

    /// Get the resource kind if this error is associated with one
    pub fn kind(&self) -> Option<&str> {
        match self {
            Error::NotFound { kind, .. }
            | Error::SpecWasTouched { kind, .. }
            | Error::StaleSpec { kind, .. }
            | Error::Storage { kind, .. }
            | Error::Runtime { kind, .. }
            | Error::Registration { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Get the entity ID if this error is associated with one
    pub fn id(&self) -> Option<&str> {
        match self {
            Error::NotFound { id, .. }
            | Error::SpecWasTouched { id, .. }
            | Error::StaleSpec { id, .. }
            | Error::Hash { id, .. } => Some(id),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: How errors steer the reconciler
    // ==========================================================================

    /// Story: a status push racing with a delete or an edit is not a failure
    ///
    /// The runtime reports progress for a training job while the user deletes
    /// it or edits its spec. The status write loses the race; the next tick
    /// converges, so the push path swallows these two errors.
    #[test]
    fn story_status_push_races_are_benign() {
        let gone = Error::not_found("training", "t1");
        assert!(gone.is_not_found());
        assert!(gone.is_benign_race());
        assert_eq!(gone.to_string(), "training 't1' not found");

        let touched = Error::spec_was_touched("training", "t1");
        assert!(!touched.is_not_found());
        assert!(touched.is_benign_race());
        assert!(touched.to_string().contains("touched concurrently"));

        // A stale spec is an explicit abort, not a silent race
        let stale = Error::stale_spec("training", "t1");
        assert!(!stale.is_benign_race());
        assert!(stale.is_retryable());
    }

    /// Story: structured errors carry kind and ID for log correlation
    #[test]
    fn story_errors_carry_entity_context() {
        let err = Error::spec_was_touched("deployment", "d-42");
        assert_eq!(err.kind(), Some("deployment"));
        assert_eq!(err.id(), Some("d-42"));

        let err = Error::hash("p-7", "map key must be a string");
        assert_eq!(err.kind(), None);
        assert_eq!(err.id(), Some("p-7"));
        assert!(err.to_string().contains("map key must be a string"));

        let err = Error::storage("route", "connection reset");
        assert_eq!(err.kind(), Some("route"));
        assert_eq!(err.id(), None);
        assert_eq!(err.to_string(), "storage error [route]: connection reset");
    }

    /// Story: setup failures are fatal while listing failures are retried
    #[test]
    fn story_setup_errors_are_not_retryable() {
        assert!(!Error::registration("training", "watch unavailable").is_retryable());
        assert!(!Error::config("lease duration must exceed renew deadline").is_retryable());
        assert!(!Error::hash("t1", "bad payload").is_retryable());

        assert!(Error::storage("training", "timeout").is_retryable());
        assert!(Error::runtime("training", "apiserver unavailable").is_retryable());
    }

    #[test]
    fn test_internal_error_context() {
        let err = Error::internal("boom");
        match &err {
            Error::Internal { context, .. } => assert_eq!(context, UNKNOWN_CONTEXT),
            _ => panic!("Expected Internal variant"),
        }

        let err = Error::internal_with_context("supervisor", "worker panicked");
        assert_eq!(
            err.to_string(),
            "internal error [supervisor]: worker panicked"
        );
    }

    #[test]
    fn test_serde_json_errors_convert_to_serialization() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn test_leader_election_errors_wrap() {
        let err: Error = LeaderElectionError::InvalidConfig("retry period is zero".into()).into();
        assert!(err.to_string().contains("retry period is zero"));
        assert!(!err.is_retryable());

        let err: Error = LeaderElectionError::Backend("lease store unavailable".into()).into();
        assert!(err.is_retryable());
    }
}

//! Operator configuration
//!
//! Loaded from an optional YAML file; every field has a default so an empty
//! or missing file yields a runnable single-replica configuration.
//!
//! ```yaml
//! identity: weft-0
//! gracefulTimeoutSecs: 30
//! leaderElection:
//!   backend: kubernetes
//!   namespace: weft-system
//!   leaseDurationSecs: 15
//!   renewDeadlineSecs: 10
//!   retryPeriodSecs: 2
//! workers:
//!   training:
//!     launchPeriodSecs: 5
//!   batch-inference:
//!     enabled: false
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::leader_election::LeaderElectionConfig;
use crate::{Error, Result, DEFAULT_LEASE_NAME, DEFAULT_LEASE_NAMESPACE};

const DEFAULT_GRACEFUL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LAUNCH_PERIOD_SECS: u64 = 10;

/// Resource kinds reconciled by the operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Model training jobs
    Training,
    /// Model packaging jobs
    Packaging,
    /// Model deployments
    Deployment,
    /// Traffic routing rules
    Route,
    /// Batch inference jobs
    BatchInference,
}

impl ResourceKind {
    /// Every kind, in reconciliation registration order
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Training,
        ResourceKind::Packaging,
        ResourceKind::Deployment,
        ResourceKind::Route,
        ResourceKind::BatchInference,
    ];

    /// Stable name used in logs and configuration keys
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Training => "training",
            ResourceKind::Packaging => "packaging",
            ResourceKind::Deployment => "deployment",
            ResourceKind::Route => "route",
            ResourceKind::BatchInference => "batch-inference",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lease backend selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaseBackend {
    /// coordination.k8s.io/v1 Lease
    #[default]
    Kubernetes,
    /// In-process lease, for single-instance deployments
    Local,
}

/// Leader election settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LeaderElectionSettings {
    /// Lease backend
    pub backend: LeaseBackend,
    /// Lease object name
    pub lease_name: String,
    /// Namespace holding the lease
    pub namespace: String,
    /// Lease validity without renewal
    pub lease_duration_secs: u64,
    /// How long the leader retries renewal before stepping down
    pub renew_deadline_secs: u64,
    /// Interval between acquire/renew attempts
    pub retry_period_secs: u64,
}

impl Default for LeaderElectionSettings {
    fn default() -> Self {
        let timing = LeaderElectionConfig::default();
        Self {
            backend: LeaseBackend::default(),
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            namespace: DEFAULT_LEASE_NAMESPACE.to_string(),
            lease_duration_secs: timing.lease_duration.as_secs(),
            renew_deadline_secs: timing.renew_deadline.as_secs(),
            retry_period_secs: timing.retry_period.as_secs(),
        }
    }
}

impl LeaderElectionSettings {
    /// Timing parameters for the elector
    pub fn timing(&self) -> LeaderElectionConfig {
        LeaderElectionConfig {
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_deadline: Duration::from_secs(self.renew_deadline_secs),
            retry_period: Duration::from_secs(self.retry_period_secs),
        }
    }
}

/// Per-kind worker settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerSettings {
    /// Whether a worker runs for this kind
    pub enabled: bool,
    /// Interval between reconciliation ticks
    pub launch_period_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            launch_period_secs: DEFAULT_LAUNCH_PERIOD_SECS,
        }
    }
}

impl WorkerSettings {
    /// Interval between reconciliation ticks
    pub fn launch_period(&self) -> Duration {
        Duration::from_secs(self.launch_period_secs)
    }
}

/// Top-level operator configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Lock holder identity; resolved from the environment when unset
    pub identity: Option<String>,
    /// Time allowed for unwinding after a shutdown signal
    pub graceful_timeout_secs: u64,
    /// Leader election settings
    pub leader_election: LeaderElectionSettings,
    /// Worker settings by resource kind; missing kinds use defaults
    pub workers: BTreeMap<ResourceKind, WorkerSettings>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            identity: None,
            graceful_timeout_secs: DEFAULT_GRACEFUL_TIMEOUT_SECS,
            leader_election: LeaderElectionSettings::default(),
            workers: BTreeMap::new(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a YAML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::config(format!("failed to read {}: {}", path.display(), e))
                })?;
                Self::from_yaml(&raw)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| Error::config(format!("invalid YAML: {}", e)))
    }

    /// Reject zero periods and inconsistent lease timing
    pub fn validate(&self) -> Result<()> {
        if self.graceful_timeout_secs == 0 {
            return Err(Error::config("gracefulTimeoutSecs must be greater than zero"));
        }
        self.leader_election
            .timing()
            .validate()
            .map_err(|e| Error::config(e.to_string()))?;
        for (kind, settings) in &self.workers {
            if settings.enabled && settings.launch_period_secs == 0 {
                return Err(Error::config(format!(
                    "workers.{}.launchPeriodSecs must be greater than zero",
                    kind
                )));
            }
        }
        Ok(())
    }

    /// Settings for one kind, falling back to defaults
    pub fn worker(&self, kind: ResourceKind) -> WorkerSettings {
        self.workers.get(&kind).cloned().unwrap_or_default()
    }

    /// Kinds with an enabled worker, in registration order
    pub fn enabled_kinds(&self) -> Vec<ResourceKind> {
        ResourceKind::ALL
            .into_iter()
            .filter(|kind| self.worker(*kind).enabled)
            .collect()
    }

    /// Time allowed for unwinding after a shutdown signal
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }

    /// Resolve the lock holder identity
    ///
    /// Order: configured value, `POD_NAME`, `HOSTNAME` with a random suffix.
    /// The suffix keeps two processes on one host from sharing an identity.
    pub fn resolve_identity(&self) -> String {
        if let Some(identity) = self.identity.as_ref().filter(|i| !i.is_empty()) {
            return identity.clone();
        }
        if let Ok(pod) = std::env::var("POD_NAME") {
            if !pod.is_empty() {
                return pod;
            }
        }
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "weft".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", host, &suffix[..8])
    }
}

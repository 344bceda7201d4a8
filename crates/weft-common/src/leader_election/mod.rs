//! Leader election over a pluggable lease backend
//!
//! Exactly one reconciler replica may be active at a time. Replicas campaign
//! for a renewable lease through a [`LeaseLock`] backend; the winner receives
//! a [`LeaderGuard`] whose cancellation token stays live only while the lease
//! is held.
//!
//! # Timing
//!
//! Three tunables mirror the usual lease semantics:
//! - `lease_duration`: how long a lease is valid without renewal
//! - `renew_deadline`: how long the leader keeps retrying a failing renewal
//!   before stepping down
//! - `retry_period`: interval between acquisition and renewal attempts
//!
//! The leader gives up after `renew_deadline`, which is shorter than
//! `lease_duration`, so it has stopped acting before any standby can take the
//! lease over.
//!
//! # Backends
//!
//! - [`kubernetes::KubeLeaseLock`]: coordination.k8s.io/v1 Lease (feature `kubernetes`)
//! - [`local::LocalLeaseLock`]: in-process lease for single-instance deployments

#[cfg(feature = "kubernetes")]
pub mod kubernetes;
pub mod local;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[cfg(feature = "kubernetes")]
    #[error("kubernetes API error: {0}")]
    Kube(#[from] ::kube::Error),

    /// Backend-specific failure
    #[error("lease backend error: {0}")]
    Backend(String),

    /// Timing parameters are inconsistent
    #[error("invalid leader election config: {0}")]
    InvalidConfig(String),
}

impl LeaderElectionError {
    /// Invalid configuration never heals on retry
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LeaderElectionError::InvalidConfig(_))
    }
}

/// Lease timing parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// How long an unrenewed lease stays valid
    pub lease_duration: Duration,
    /// How long the leader retries renewal before stepping down
    pub renew_deadline: Duration,
    /// Interval between acquire/renew attempts
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: LEASE_DURATION,
            renew_deadline: RENEW_DEADLINE,
            retry_period: RETRY_PERIOD,
        }
    }
}

impl LeaderElectionConfig {
    /// Check `lease_duration > renew_deadline > retry_period > 0`
    pub fn validate(&self) -> Result<(), LeaderElectionError> {
        if self.retry_period.is_zero() {
            return Err(LeaderElectionError::InvalidConfig(
                "retry period must be greater than zero".to_string(),
            ));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(LeaderElectionError::InvalidConfig(format!(
                "renew deadline ({:?}) must be greater than retry period ({:?})",
                self.renew_deadline, self.retry_period
            )));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(LeaderElectionError::InvalidConfig(format!(
                "lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        Ok(())
    }
}

/// A renewable, mutually exclusive lease
///
/// Implementations must make acquisition atomic: two callers with different
/// identities can never both observe `Ok(true)` for overlapping lease windows.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Acquire the lease, renew it if `identity` already holds it, or take it
    /// over if it has expired
    ///
    /// Returns `Ok(false)` when another holder owns a live lease.
    async fn try_acquire_or_renew(
        &self,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<bool, LeaderElectionError>;

    /// Give the lease up so a standby can acquire it without waiting for expiry
    ///
    /// A no-op when `identity` is not the current holder.
    async fn release(&self, identity: &str) -> Result<(), LeaderElectionError>;
}

/// Campaigns for leadership through a [`LeaseLock`]
pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    identity: String,
    config: LeaderElectionConfig,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create a new elector, rejecting inconsistent timing parameters
    pub fn new(
        lock: Arc<dyn LeaseLock>,
        identity: &str,
        config: LeaderElectionConfig,
    ) -> Result<Self, LeaderElectionError> {
        config.validate()?;
        Ok(Self {
            lock,
            identity: identity.to_string(),
            config,
            is_leader: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Identity this elector campaigns as
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Timing parameters in use
    pub fn config(&self) -> &LeaderElectionConfig {
        &self.config
    }

    /// Whether this process currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// Backend errors are logged and retried every retry period. The guard
    /// maintains leadership through periodic renewal; its token is cancelled
    /// when leadership is lost.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, "Waiting for leadership...");

        loop {
            if self.attempt().await {
                return self.create_guard();
            }
            tokio::time::sleep(self.config.retry_period).await;
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up once `cancel` fires
    ///
    /// Cancellation is only observed between attempts. An attempt already
    /// sent to the backend runs to completion, so a lease it grants is
    /// always handed back as a guard the caller can release.
    pub async fn acquire_until(
        self: Arc<Self>,
        cancel: &CancellationToken,
    ) -> Option<LeaderGuard> {
        info!(identity = %self.identity, "Waiting for leadership...");

        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if self.attempt().await {
                return Some(self.create_guard());
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// One acquire-or-renew round trip; true when this replica now leads
    async fn attempt(&self) -> bool {
        match self
            .lock
            .try_acquire_or_renew(&self.identity, self.config.lease_duration)
            .await
        {
            Ok(true) => {
                info!(identity = %self.identity, "Leadership acquired");
                self.is_leader.store(true, Ordering::SeqCst);
                true
            }
            Ok(false) => {
                debug!(
                    identity = %self.identity,
                    retry_ms = self.config.retry_period.as_millis() as u64,
                    "Lease held by another, waiting..."
                );
                false
            }
            Err(e) => {
                warn!(
                    identity = %self.identity,
                    error = %e,
                    retry_ms = self.config.retry_period.as_millis() as u64,
                    "Failed to acquire lease, retrying..."
                );
                false
            }
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let token = CancellationToken::new();
        let elector = Arc::clone(self);
        let renewal_token = token.clone();
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(renewal_token).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            token,
        }
    }

    /// Renew every retry period; step down on a competing holder or once the
    /// renew deadline passes without a successful renewal
    async fn renewal_loop(&self, token: CancellationToken) {
        let mut last_renewed = Instant::now();

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }

            let remaining = self
                .config
                .renew_deadline
                .saturating_sub(last_renewed.elapsed());
            let attempt = tokio::time::timeout(
                remaining,
                self.lock
                    .try_acquire_or_renew(&self.identity, self.config.lease_duration),
            )
            .await;

            match attempt {
                Ok(Ok(true)) => {
                    last_renewed = Instant::now();
                    debug!(identity = %self.identity, "Lease renewed");
                    continue;
                }
                Ok(Ok(false)) => {
                    warn!(identity = %self.identity, "Lease taken by another holder - lost leadership");
                }
                Ok(Err(e)) if last_renewed.elapsed() < self.config.renew_deadline => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        "Lease renewal failed, retrying within renew deadline"
                    );
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        "Renew deadline exceeded - lost leadership"
                    );
                }
                Err(_) => {
                    warn!(identity = %self.identity, "Renew deadline exceeded - lost leadership");
                }
            }

            self.is_leader.store(false, Ordering::SeqCst);
            token.cancel();
            return;
        }
    }
}

/// Guard that maintains leadership
///
/// While this guard exists and its token is live, the elector holds the lease
/// and renews it periodically. Work started on behalf of the leader should be
/// scoped to [`LeaderGuard::token`]. The renewal task is aborted and the token
/// cancelled when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    token: CancellationToken,
}

impl LeaderGuard {
    /// Token cancelled as soon as leadership is lost
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait until leadership is lost
    pub async fn lost(&self) {
        self.token.cancelled().await;
    }

    /// Whether leadership has already been lost
    pub fn is_lost(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Release leadership by giving the lease up
    ///
    /// Call this once all leader-scoped work has stopped so a standby can take
    /// over immediately instead of waiting for the lease to expire.
    pub async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        self.renewal_task.abort();
        self.token.cancel();
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.elector.lock.release(&self.elector.identity).await?;
        info!(identity = %self.elector.identity, "Lease released for fast failover");
        Ok(())
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        self.token.cancel();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn elector_with(lock: MockLeaseLock) -> Arc<LeaderElector> {
        Arc::new(
            LeaderElector::new(Arc::new(lock), "replica-a", LeaderElectionConfig::default())
                .expect("default config is valid"),
        )
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = LeaderElectionConfig::default();
        assert_eq!(config.lease_duration, Duration::from_secs(15));
        assert_eq!(config.renew_deadline, Duration::from_secs(10));
        assert_eq!(config.retry_period, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_inconsistent_timing() {
        let config = LeaderElectionConfig {
            lease_duration: Duration::from_secs(10),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        };
        assert!(matches!(
            config.validate(),
            Err(LeaderElectionError::InvalidConfig(_))
        ));

        let config = LeaderElectionConfig {
            retry_period: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = LeaderElectionConfig {
            renew_deadline: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_config_is_not_retryable() {
        assert!(!LeaderElectionError::InvalidConfig("x".into()).is_retryable());
        assert!(LeaderElectionError::Backend("x".into()).is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_competing_holder() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let mut lock = MockLeaseLock::new();
        lock.expect_try_acquire_or_renew().returning(move |_, _| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 1 {
                Err(LeaderElectionError::Backend("connection reset".into()))
            } else {
                Ok(n >= 2)
            }
        });

        let elector = elector_with(lock);
        let guard = elector.clone().acquire().await;

        assert!(attempts.load(Ordering::SeqCst) >= 3);
        assert!(elector.is_leader());
        assert!(!guard.is_lost());

        drop(guard);
        assert!(!elector.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_competing_holder_revokes_leadership() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let mut lock = MockLeaseLock::new();
        lock.expect_try_acquire_or_renew().returning(move |_, _| {
            // acquire, renew once, then another replica owns the lease
            Ok(counter.fetch_add(1, Ordering::SeqCst) < 2)
        });

        let elector = elector_with(lock);
        let guard = elector.clone().acquire().await;
        let token = guard.token();

        tokio::time::timeout(Duration::from_secs(30), guard.lost())
            .await
            .expect("leadership should be lost");
        assert!(token.is_cancelled());
        assert!(!elector.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_errors_tolerated_until_deadline() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let mut lock = MockLeaseLock::new();
        lock.expect_try_acquire_or_renew().returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(true)
            } else {
                Err(LeaderElectionError::Backend("apiserver unavailable".into()))
            }
        });

        let elector = elector_with(lock);
        let guard = elector.clone().acquire().await;

        // Failing renewals at 2s, 4s, 6s and 8s stay within the 10s deadline
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!guard.is_lost());
        assert!(elector.is_leader());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(guard.is_lost());
        assert!(!elector.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_leadership_gives_lease_up() {
        let mut lock = MockLeaseLock::new();
        lock.expect_try_acquire_or_renew()
            .returning(|_, _| Ok(true));
        lock.expect_release()
            .withf(|identity| identity == "replica-a")
            .times(1)
            .returning(|_| Ok(()));

        let elector = elector_with(lock);
        let guard = elector.clone().acquire().await;

        guard.release_leadership().await.expect("release succeeds");
        assert!(guard.is_lost());
        assert!(!elector.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_until_gives_up_between_attempts() {
        let mut lock = MockLeaseLock::new();
        lock.expect_try_acquire_or_renew()
            .returning(|_, _| Ok(false));

        let elector = elector_with(lock);
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(7)).await;
                cancel.cancel();
            }
        };

        let (guard, _) = tokio::join!(elector.clone().acquire_until(&cancel), canceller);
        assert!(guard.is_none());
        assert!(!elector.is_leader());
    }
}

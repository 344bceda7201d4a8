//! In-process lease for single-instance deployments
//!
//! Clones share one lease record, so several electors inside one process (or
//! one test) contend exactly as separate replicas would against a real backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{LeaderElectionError, LeaseLock};

#[derive(Debug)]
struct LeaseRecord {
    holder: String,
    renewed_at: Instant,
    duration: Duration,
    transitions: u32,
}

impl LeaseRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.renewed_at + self.duration
    }
}

/// Lease held in process memory
#[derive(Clone, Debug, Default)]
pub struct LocalLeaseLock {
    record: Arc<Mutex<Option<LeaseRecord>>>,
}

impl LocalLeaseLock {
    /// Create an unheld lease
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder, if the lease is held and unexpired
    pub fn holder(&self) -> Option<String> {
        let record = self.record.lock();
        record
            .as_ref()
            .filter(|r| !r.is_expired(Instant::now()))
            .map(|r| r.holder.clone())
    }

    /// Number of times the lease changed hands
    pub fn transitions(&self) -> u32 {
        self.record.lock().as_ref().map_or(0, |r| r.transitions)
    }
}

#[async_trait]
impl LeaseLock for LocalLeaseLock {
    async fn try_acquire_or_renew(
        &self,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<bool, LeaderElectionError> {
        let now = Instant::now();
        let mut record = self.record.lock();

        match record.as_mut() {
            None => {
                *record = Some(LeaseRecord {
                    holder: identity.to_string(),
                    renewed_at: now,
                    duration: lease_duration,
                    transitions: 0,
                });
                info!(identity = %identity, "Created new local lease");
                Ok(true)
            }
            Some(current) if current.holder == identity => {
                current.renewed_at = now;
                current.duration = lease_duration;
                Ok(true)
            }
            Some(current) if current.is_expired(now) => {
                debug!(
                    identity = %identity,
                    previous = %current.holder,
                    "Taking over expired local lease"
                );
                current.holder = identity.to_string();
                current.renewed_at = now;
                current.duration = lease_duration;
                current.transitions += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn release(&self, identity: &str) -> Result<(), LeaderElectionError> {
        let mut record = self.record.lock();
        if let Some(current) = record.as_mut() {
            if current.holder == identity {
                // Backdate so the next contender takes over immediately
                current.duration = Duration::ZERO;
                debug!(identity = %identity, "Local lease released");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(15);

    #[tokio::test]
    async fn test_first_contender_wins() {
        let lock = LocalLeaseLock::new();
        assert!(lock.try_acquire_or_renew("a", LEASE).await.unwrap());
        assert!(!lock.try_acquire_or_renew("b", LEASE).await.unwrap());
        assert_eq!(lock.holder().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_holder_renews() {
        let lock = LocalLeaseLock::new();
        assert!(lock.try_acquire_or_renew("a", LEASE).await.unwrap());
        assert!(lock.try_acquire_or_renew("a", LEASE).await.unwrap());
        assert_eq!(lock.transitions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_taken_over() {
        let lock = LocalLeaseLock::new();
        assert!(lock.try_acquire_or_renew("a", LEASE).await.unwrap());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!lock.try_acquire_or_renew("b", LEASE).await.unwrap());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(lock.try_acquire_or_renew("b", LEASE).await.unwrap());
        assert_eq!(lock.holder().as_deref(), Some("b"));
        assert_eq!(lock.transitions(), 1);

        // The old holder cannot silently renew after losing the lease
        assert!(!lock.try_acquire_or_renew("a", LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_allows_immediate_takeover() {
        let lock = LocalLeaseLock::new();
        assert!(lock.try_acquire_or_renew("a", LEASE).await.unwrap());

        // Releasing as a non-holder is a no-op
        lock.release("b").await.unwrap();
        assert_eq!(lock.holder().as_deref(), Some("a"));

        lock.release("a").await.unwrap();
        assert_eq!(lock.holder(), None);
        assert!(lock.try_acquire_or_renew("b", LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_clones_share_the_lease() {
        let lock = LocalLeaseLock::new();
        let replica = lock.clone();
        assert!(lock.try_acquire_or_renew("a", LEASE).await.unwrap());
        assert!(!replica.try_acquire_or_renew("b", LEASE).await.unwrap());
    }
}

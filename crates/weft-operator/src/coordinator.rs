//! Leader-gated lifecycle of the reconciler
//!
//! Only the lease holder reconciles. Each leadership term starts the worker
//! supervisor and the runtime-watch subsystem under one term token; the term
//! ends when the lease is lost, either task exits, or the process shuts down.
//! Both tasks are awaited to completion before the lease is released, so a
//! replica that wins the next term never overlaps with this one.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use weft_common::leader_election::{LeaderElector, LeaderGuard};
use weft_common::metrics;
use weft_common::Result;
use weft_sync::Runnable;

/// Why a leadership term ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermEnd {
    /// Process shutdown was requested
    Shutdown,
    /// The lease was lost to another holder or could not be renewed
    LeaseLost,
    /// The reconciler or the watcher exited on its own
    TaskExited,
}

/// Runs the reconciler and watcher while this process holds the lease
pub struct LeaderCoordinator {
    elector: Arc<LeaderElector>,
    reconciler: Arc<dyn Runnable>,
    watcher: Arc<dyn Runnable>,
}

impl LeaderCoordinator {
    /// Create a coordinator campaigning through `elector`
    pub fn new(
        elector: Arc<LeaderElector>,
        reconciler: Arc<dyn Runnable>,
        watcher: Arc<dyn Runnable>,
    ) -> Self {
        Self {
            elector,
            reconciler,
            watcher,
        }
    }

    /// Campaign and lead until `shutdown` is cancelled
    ///
    /// Failures inside a term end that term only; the coordinator backs off
    /// one retry period and campaigns again.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let identity = self.elector.identity().to_string();
        let retry_period = self.elector.config().retry_period;

        loop {
            // A lease granted while shutdown fires still comes back as a guard
            // and is released below
            let Some(guard) = self.elector.clone().acquire_until(&shutdown).await else {
                info!(identity = %identity, "Shutdown requested while campaigning");
                return Ok(());
            };

            let end = self.lead(&guard, &shutdown).await;

            if let Err(e) = guard.release_leadership().await {
                warn!(identity = %identity, error = %e, "Failed to release lease, it will expire");
            }
            drop(guard);

            if end == TermEnd::Shutdown || shutdown.is_cancelled() {
                info!(identity = %identity, "Coordinator stopped");
                return Ok(());
            }

            info!(
                identity = %identity,
                reason = ?end,
                retry_ms = retry_period.as_millis() as u64,
                "Leadership term ended, campaigning again"
            );
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(retry_period) => {}
            }
        }
    }

    /// Run one term, returning once both tasks have exited
    async fn lead(&self, guard: &LeaderGuard, shutdown: &CancellationToken) -> TermEnd {
        let identity = self.elector.identity();
        let term = shutdown.child_token();
        let tracker = TaskTracker::new();

        for task in [self.reconciler.clone(), self.watcher.clone()] {
            let term = term.clone();
            tracker.spawn(async move {
                // Also cancels the term if the task panics
                let _end_term = term.clone().drop_guard();
                match task.run(term).await {
                    Ok(()) => info!(task = %task.name(), "Leader task exited"),
                    Err(e) => error!(task = %task.name(), error = %e, "Leader task failed"),
                }
            });
        }
        tracker.close();
        metrics::set_leader(identity, true);
        info!(identity = %identity, "Leading, reconciler started");

        tokio::select! {
            _ = term.cancelled() => {}
            _ = guard.lost() => {}
        }
        let end = if shutdown.is_cancelled() {
            TermEnd::Shutdown
        } else if guard.is_lost() {
            TermEnd::LeaseLost
        } else {
            TermEnd::TaskExited
        };
        match end {
            TermEnd::LeaseLost => warn!(identity = %identity, "Leadership lost, stopping reconciler"),
            _ => info!(identity = %identity, reason = ?end, "Stopping reconciler"),
        }

        term.cancel();
        tracker.wait().await;
        metrics::set_leader(identity, false);
        info!(identity = %identity, "Reconciler fully stopped");
        end
    }
}

#[async_trait]
impl Runnable for LeaderCoordinator {
    fn name(&self) -> &str {
        "leader-coordinator"
    }

    async fn run(&self, token: CancellationToken) -> Result<()> {
        LeaderCoordinator::run(self, token).await
    }
}

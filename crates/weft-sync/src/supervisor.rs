//! Fail-fast supervision of long-running tasks
//!
//! All runnables share one cancellation scope: the first to return, with or
//! without an error, cancels the rest. The supervisor returns only after every
//! runnable has exited, so nothing it started outlives it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use weft_common::{Error, Result};

/// A long-running task stopped through a cancellation token
#[async_trait]
pub trait Runnable: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Run until `token` is cancelled or a fatal error occurs
    async fn run(&self, token: CancellationToken) -> Result<()>;
}

/// Runs a fixed set of runnables, stopping all when one exits
pub struct Supervisor {
    name: String,
    runnables: Mutex<Vec<Arc<dyn Runnable>>>,
}

impl Supervisor {
    /// Create an empty supervisor
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runnables: Mutex::new(Vec::new()),
        }
    }

    /// Register a runnable
    ///
    /// Runnables added after [`Supervisor::run`] started are picked up by the
    /// next run only.
    pub fn add_runnable(&self, runnable: Arc<dyn Runnable>) {
        self.runnables.lock().push(runnable);
    }

    /// Number of registered runnables
    pub fn len(&self) -> usize {
        self.runnables.lock().len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.runnables.lock().is_empty()
    }

    /// Run every registered runnable until one exits or `token` is cancelled
    ///
    /// Returns the first error any runnable reported, `Ok(())` otherwise. A
    /// panicking runnable is reported as [`Error::Internal`]. With nothing
    /// registered this blocks until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let runnables: Vec<Arc<dyn Runnable>> = self.runnables.lock().clone();
        let scope = token.child_token();
        let (done_tx, mut done_rx) = mpsc::channel(runnables.len().max(1));

        info!(supervisor = %self.name, runnables = runnables.len(), "Starting runnables");
        for runnable in &runnables {
            let runnable = runnable.clone();
            let scope = scope.clone();
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                let result = AssertUnwindSafe(runnable.run(scope))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                            s.to_string()
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "unknown panic".to_string()
                        };
                        Err(Error::internal_with_context(
                            runnable.name(),
                            format!("panicked: {msg}"),
                        ))
                    });
                // Capacity covers every runnable, so this never waits
                let _ = done_tx.send((runnable.name().to_string(), result)).await;
            });
        }
        drop(done_tx);

        let mut first_error = None;
        let mut remaining = runnables.len();
        while remaining > 0 {
            let Some((name, result)) = done_rx.recv().await else {
                break;
            };
            remaining -= 1;

            if !scope.is_cancelled() {
                match &result {
                    Ok(()) => info!(
                        supervisor = %self.name,
                        runnable = %name,
                        "Runnable exited, stopping the rest"
                    ),
                    Err(e) => error!(
                        supervisor = %self.name,
                        runnable = %name,
                        error = %e,
                        "Runnable failed, stopping the rest"
                    ),
                }
                scope.cancel();
            } else if let Err(e) = &result {
                warn!(supervisor = %self.name, runnable = %name, error = %e, "Runnable failed while stopping");
            }

            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        scope.cancelled().await;
        info!(supervisor = %self.name, "All runnables stopped");
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Runnable for Supervisor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, token: CancellationToken) -> Result<()> {
        Supervisor::run(self, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    enum Behavior {
        UntilCancelled,
        FailAfter(Duration),
        ExitAfter(Duration),
        PanicAfter(Duration),
        FailOnCancel,
    }

    struct Stub {
        name: String,
        behavior: Behavior,
        stopped: AtomicBool,
        runs: AtomicUsize,
    }

    impl Stub {
        fn new(name: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                behavior,
                stopped: AtomicBool::new(false),
                runs: AtomicUsize::new(0),
            })
        }

        fn stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Runnable for Stub {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, token: CancellationToken) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let result = match self.behavior {
                Behavior::UntilCancelled => {
                    token.cancelled().await;
                    Ok(())
                }
                Behavior::FailAfter(after) => {
                    tokio::time::sleep(after).await;
                    Err(Error::registration("training", "watch refused"))
                }
                Behavior::ExitAfter(after) => {
                    tokio::time::sleep(after).await;
                    Ok(())
                }
                Behavior::PanicAfter(after) => {
                    tokio::time::sleep(after).await;
                    panic!("adapter invariant broken");
                }
                Behavior::FailOnCancel => {
                    token.cancelled().await;
                    Err(Error::internal("cleanup failed"))
                }
            };
            self.stopped.store(true, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test]
    async fn test_one_failure_stops_every_runnable() {
        let supervisor = Supervisor::new("reconciler");
        let steady = Stub::new("packaging-worker", Behavior::UntilCancelled);
        let other = Stub::new("route-worker", Behavior::UntilCancelled);
        let failing = Stub::new("training-worker", Behavior::FailAfter(Duration::ZERO));
        supervisor.add_runnable(steady.clone());
        supervisor.add_runnable(failing.clone());
        supervisor.add_runnable(other.clone());

        // Siblings are cancelled promptly, not at their next natural exit
        let err = tokio::time::timeout(
            Duration::from_secs(1),
            supervisor.run(CancellationToken::new()),
        )
        .await
        .expect("siblings should stop within a second of the failure")
        .unwrap_err();

        assert!(matches!(err, Error::Registration { .. }));
        assert!(steady.stopped());
        assert!(other.stopped());
        assert!(failing.stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_also_stops_the_rest() {
        let supervisor = Supervisor::new("reconciler");
        let steady = Stub::new("packaging-worker", Behavior::UntilCancelled);
        supervisor.add_runnable(steady.clone());
        supervisor.add_runnable(Stub::new("route-worker", Behavior::ExitAfter(Duration::from_secs(1))));

        supervisor.run(CancellationToken::new()).await.unwrap();
        assert!(steady.stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_everything() {
        let supervisor = Arc::new(Supervisor::new("reconciler"));
        let a = Stub::new("training-worker", Behavior::UntilCancelled);
        let b = Stub::new("deployment-worker", Behavior::UntilCancelled);
        supervisor.add_runnable(a.clone());
        supervisor.add_runnable(b.clone());
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let supervisor = supervisor.clone();
            let token = token.clone();
            async move { supervisor.run(token).await }
        });
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!handle.is_finished());

        token.cancel();
        handle.await.unwrap().unwrap();
        assert!(a.stopped());
        assert!(b.stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_reported_as_error() {
        let supervisor = Supervisor::new("reconciler");
        let steady = Stub::new("route-worker", Behavior::UntilCancelled);
        supervisor.add_runnable(steady.clone());
        supervisor.add_runnable(Stub::new("training-worker", Behavior::PanicAfter(Duration::from_secs(1))));

        let err = supervisor.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, Error::Internal { .. }));
        assert!(err.to_string().contains("adapter invariant broken"));
        assert!(steady.stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_error_wins() {
        let supervisor = Supervisor::new("reconciler");
        supervisor.add_runnable(Stub::new("training-worker", Behavior::FailAfter(Duration::from_secs(1))));
        supervisor.add_runnable(Stub::new("route-worker", Behavior::FailOnCancel));

        let err = supervisor.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Registration { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_supervisor_blocks_until_cancelled() {
        let supervisor = Arc::new(Supervisor::new("reconciler"));
        assert!(supervisor.is_empty());
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let supervisor = supervisor.clone();
            let token = token.clone();
            async move { supervisor.run(token).await }
        });
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!handle.is_finished());

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisors_nest() {
        let inner = Arc::new(Supervisor::new("watchers"));
        inner.add_runnable(Stub::new("training-watcher", Behavior::FailAfter(Duration::from_secs(2))));

        let outer = Supervisor::new("term");
        let sibling = Stub::new("reconciler", Behavior::UntilCancelled);
        outer.add_runnable(inner.clone());
        outer.add_runnable(sibling.clone());
        assert_eq!(outer.len(), 2);
        assert_eq!(Runnable::name(inner.as_ref()), "watchers");

        let err = outer.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Registration { .. }));
        assert!(sibling.stopped());
        assert_eq!(sibling.runs.load(Ordering::SeqCst), 1);
    }
}

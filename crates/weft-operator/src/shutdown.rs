//! Signal handling and bounded-grace shutdown

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// How the process's main task ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Unwound cleanly within the grace period
    Clean,
    /// Returned an error or panicked
    Failed,
    /// Still unwinding when the grace period elapsed
    GraceElapsed,
}

impl ShutdownOutcome {
    /// Process exit status for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownOutcome::Clean => 0,
            ShutdownOutcome::Failed | ShutdownOutcome::GraceElapsed => 1,
        }
    }
}

/// Resolve on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received terminate signal, initiating graceful shutdown"),
    }
}

/// Run `task` until it returns or `signal` fires, then allow `grace` to unwind
///
/// `task` receives the root cancellation token. If it returns on its own,
/// its result decides the outcome. Once `signal` fires the token is cancelled
/// and the task is abandoned if it has not finished after `grace`.
pub async fn run_with_grace<F, Fut, E>(
    task: F,
    signal: impl Future<Output = ()>,
    grace: Duration,
) -> ShutdownOutcome
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let root = CancellationToken::new();
    let mut handle = tokio::spawn(task(root.clone()));

    tokio::select! {
        joined = &mut handle => return outcome_of(joined),
        _ = signal => {}
    }

    root.cancel();
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(joined) => outcome_of(joined),
        Err(_) => {
            error!(
                grace_secs = grace.as_secs(),
                "Graceful shutdown timed out, forcing exit"
            );
            handle.abort();
            ShutdownOutcome::GraceElapsed
        }
    }
}

fn outcome_of<E: Display>(joined: Result<Result<(), E>, JoinError>) -> ShutdownOutcome {
    match joined {
        Ok(Ok(())) => {
            info!("Shutdown complete");
            ShutdownOutcome::Clean
        }
        Ok(Err(e)) => {
            error!(error = %e, "Stopped with an error");
            ShutdownOutcome::Failed
        }
        Err(e) => {
            error!(error = %e, "Main task panicked or was aborted");
            ShutdownOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use weft_common::Error;

    fn after(secs: u64) -> impl Future<Output = ()> {
        tokio::time::sleep(Duration::from_secs(secs))
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_unwind_within_grace_exits_zero() {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let flag = saw_cancel.clone();

        let outcome = run_with_grace(
            move |token: CancellationToken| async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_secs(2)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<(), Error>(())
            },
            after(5),
            Duration::from_secs(30),
        )
        .await;

        assert_eq!(outcome, ShutdownOutcome::Clean);
        assert_eq!(outcome.exit_code(), 0);
        assert!(saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_unwind_is_bounded_by_grace() {
        let started = tokio::time::Instant::now();

        let outcome = run_with_grace(
            |_token: CancellationToken| async move {
                std::future::pending::<()>().await;
                Ok::<(), Error>(())
            },
            after(5),
            Duration::from_secs(30),
        )
        .await;

        assert_eq!(outcome, ShutdownOutcome::GraceElapsed);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(35));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_before_signal_exits_one() {
        let outcome = run_with_grace(
            |_token: CancellationToken| async move {
                Err::<(), _>(Error::config("unable to construct lease client"))
            },
            std::future::pending::<()>(),
            Duration::from_secs(30),
        )
        .await;

        assert_eq!(outcome, ShutdownOutcome::Failed);
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_is_a_failure() {
        let outcome = run_with_grace(
            |token: CancellationToken| async move {
                token.cancelled().await;
                if token.is_cancelled() {
                    panic!("unwind bug");
                }
                Ok::<(), Error>(())
            },
            after(1),
            Duration::from_secs(30),
        )
        .await;

        assert_eq!(outcome, ShutdownOutcome::Failed);
    }
}

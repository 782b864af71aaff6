//! Graceful shutdown coordination for relay tasks.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Cancellation signal plus a tracker for every task spawned through it.
///
/// Accept loops select on [`Graceful::cancelled`]; per-session tasks are
/// spawned with [`Graceful::spawn`] so [`Graceful::shutdown`] can wait for
/// them to finish. Cloning is cheap and every clone shares the same state.
#[derive(Debug, Clone, Default)]
pub struct Graceful {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Graceful {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task that shutdown will wait for.
    pub fn spawn<F>(&self, task: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Request shutdown without waiting for tasks. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that fires with this coordinator.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request shutdown and wait up to `grace` for tracked tasks.
    ///
    /// Returns `false` if tasks were still running when `grace` elapsed.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.cancel.cancel();
        self.tracker.close();

        let in_flight = self.tracker.len();
        if in_flight > 0 {
            tracing::debug!("Waiting for {in_flight} in-flight sessions");
        }

        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    "{} sessions still running after {:?}",
                    self.tracker.len(),
                    grace
                );
                false
            }
        }
    }
}

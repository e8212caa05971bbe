use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Shutdown signal plus completion barrier shared by every background task.
///
/// Loops watch `token()` and stop scheduling once it is cancelled. Work that
/// is already running is tracked, not cancelled, so `wait` returns only after
/// in-flight fetches have finished.
#[derive(Clone, Default)]
pub struct Lifecycle {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested, no new fetches will be scheduled");
        }
        self.token.cancel();
    }

    /// Wait for every tracked task to finish. Returns false if `timeout`
    /// expired first.
    pub async fn wait(&self, timeout: Duration) -> bool {
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            info!("All tasks finished");
            true
        } else {
            warn!(
                timeout = ?timeout,
                remaining = self.tracker.len(),
                "Shutdown timed out with tasks still running"
            );
            false
        }
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("cancelled", &self.token.is_cancelled())
            .field("tasks", &self.tracker.len())
            .finish()
    }
}

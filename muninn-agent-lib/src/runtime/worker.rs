use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A long-lived cooperative worker task with an associated stop signal.
///
/// Work functions receive the token through [`StoppableWorker::token`] and
/// must race it at every blocking point (`select!`, [`pause`]); `stop`
/// cancels the token and joins the task.
pub struct StoppableWorker {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StoppableWorker {
    pub fn new() -> Self {
        Self { token: CancellationToken::new(), handle: Mutex::new(None) }
    }

    /// The stop signal work functions must poll.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn should_stop(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawns the work future. Returns false (without spawning) if the
    /// worker was already started.
    pub fn start<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(tokio::spawn(work));
        true
    }

    /// Cancels the stop token and waits for the work future to unwind.
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = {
            let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "worker task did not exit cleanly");
            }
        }
    }
}

impl Default for StoppableWorker {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeps for `duration` unless the token fires first. Returns true if
/// the full pause elapsed, false if it was interrupted.
pub async fn pause(duration: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

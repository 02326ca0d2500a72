//! Deferred reclamation of served scratch archives.
//!
//! Every streamed archive owns a [`ReclaimGuard`]. When the response body is
//! dropped (download finished, failed, or the client went away) the guard
//! schedules one delayed cleanup that deletes the scratch file and then runs a
//! completion callback, normally removing the registry entry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

type Completion = Box<dyn FnOnce() + Send + 'static>;

/// Owner of all pending delayed cleanups.
#[derive(Clone)]
pub struct Reclaimer {
    delay: Duration,
    tracker: TaskTracker,
    cancel: CancellationToken,
    // Serializes close/reopen of the tracker between `wait_idle` and `shutdown`.
    lifecycle: Arc<Mutex<()>>,
}

impl Reclaimer {
    /// Create a reclaimer whose items fire `delay` after scheduling, or
    /// immediately once `cancel` is triggered.
    pub fn new(delay: Duration, cancel: CancellationToken) -> Self {
        Self {
            delay,
            tracker: TaskTracker::new(),
            cancel,
            lifecycle: Arc::new(Mutex::new(())),
        }
    }

    /// Schedule deletion of `path` followed by `on_complete`.
    ///
    /// Outside a Tokio runtime the cleanup runs synchronously instead.
    pub fn schedule<F>(&self, path: PathBuf, on_complete: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(path = %path.display(), "No runtime available, reclaiming immediately");
            match std::fs::remove_file(&path) {
                Ok(()) => crate::metrics::SCRATCH_FILES_REMOVED.inc(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove scratch archive")
                }
            }
            on_complete();
            return;
        };

        let delay = self.delay;
        let cancel = self.cancel.clone();
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        tracing::debug!(path = %path.display(), "Shutting down, reclaiming early");
                    }
                }
                remove_scratch_file(&path).await;
                on_complete();
            },
            &runtime,
        );
    }

    /// Create a guard that schedules cleanup of `path` when dropped.
    pub fn guard<F>(&self, path: PathBuf, on_complete: F) -> ReclaimGuard
    where
        F: FnOnce() + Send + 'static,
    {
        ReclaimGuard {
            reclaimer: self.clone(),
            armed: Some((path, Box::new(on_complete))),
        }
    }

    /// Number of cleanups scheduled but not yet finished.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every scheduled cleanup has run.
    ///
    /// After shutdown the tracker stays closed.
    pub async fn wait_idle(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.tracker.close();
        self.tracker.wait().await;
        if !self.cancel.is_cancelled() {
            self.tracker.reopen();
        }
    }

    /// Fire all pending cleanups now and wait for them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let _lifecycle = self.lifecycle.lock().await;
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Schedules exactly one cleanup when dropped.
pub struct ReclaimGuard {
    reclaimer: Reclaimer,
    armed: Option<(PathBuf, Completion)>,
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Some((path, on_complete)) = self.armed.take() {
            tracing::debug!(
                path = %path.display(),
                delay_secs = self.reclaimer.delay.as_secs(),
                "Scheduling scratch archive cleanup"
            );
            self.reclaimer.schedule(path, on_complete);
        }
    }
}

/// Delete a scratch archive. A missing file counts as already reclaimed.
pub async fn remove_scratch_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            crate::metrics::SCRATCH_FILES_REMOVED.inc();
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove scratch archive");
            false
        }
    }
}

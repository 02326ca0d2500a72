//! Keeping the mirror root in sync with its upstream repository.

use async_trait::async_trait;
use patcher_core::config::MirrorConfig;
use std::path::PathBuf;
use std::process::Output;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// What a sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The root did not exist and was cloned.
    Cloned,
    /// The existing root was updated.
    Pulled,
    /// No upstream configured.
    Skipped,
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {operation} exited with {status}: {stderr}")]
    GitFailed {
        operation: &'static str,
        status: String,
        stderr: String,
    },
}

/// Source the mirror root is synced from.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn sync(&self) -> Result<SyncOutcome, MirrorError>;
}

/// Git-backed upstream: clone when the root is absent, pull otherwise.
#[derive(Debug, Clone)]
pub struct GitUpstream {
    root: PathBuf,
    repo_url: Option<String>,
}

impl GitUpstream {
    pub fn new(root: impl Into<PathBuf>, repo_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            repo_url,
        }
    }

    pub fn from_config(config: &MirrorConfig) -> Self {
        Self::new(config.root.clone(), config.repo_url.clone())
    }
}

fn check(operation: &'static str, output: Output) -> Result<(), MirrorError> {
    if output.status.success() {
        return Ok(());
    }
    Err(MirrorError::GitFailed {
        operation,
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[async_trait]
impl Upstream for GitUpstream {
    #[tracing::instrument(skip(self), fields(root = %self.root.display()))]
    async fn sync(&self) -> Result<SyncOutcome, MirrorError> {
        let Some(url) = &self.repo_url else {
            tracing::debug!("No upstream repository configured, skipping sync");
            return Ok(SyncOutcome::Skipped);
        };

        if tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            let output = Command::new("git")
                .arg("-C")
                .arg(&self.root)
                .arg("pull")
                .output()
                .await?;
            check("pull", output)?;
            tracing::info!("Mirror updated from upstream");
            Ok(SyncOutcome::Pulled)
        } else {
            let output = Command::new("git")
                .arg("clone")
                .arg(url)
                .arg(&self.root)
                .output()
                .await?;
            check("clone", output)?;
            tracing::info!(repo = %url, "Mirror cloned from upstream");
            Ok(SyncOutcome::Cloned)
        }
    }
}

/// Debounced, fire-and-forget resync.
///
/// At most one resync is pending at a time; triggers arriving while one is
/// pending are folded into it.
#[derive(Clone)]
pub struct ResyncTrigger {
    upstream: Arc<dyn Upstream>,
    delay: Duration,
    pending: Arc<AtomicBool>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ResyncTrigger {
    pub fn new(upstream: Arc<dyn Upstream>, delay: Duration, cancel: CancellationToken) -> Self {
        Self {
            upstream,
            delay,
            pending: Arc::new(AtomicBool::new(false)),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Schedule a resync after the debounce delay.
    ///
    /// Returns `false` when a resync was already pending.
    pub fn trigger(&self) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            tracing::debug!("Resync already pending, coalescing");
            return false;
        }

        let upstream = self.upstream.clone();
        let pending = self.pending.clone();
        let delay = self.delay;
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    pending.store(false, Ordering::Release);
                    tracing::debug!("Shutting down, dropping pending resync");
                    return;
                }
            }
            // Cleared before syncing so a trigger during the sync schedules another.
            pending.store(false, Ordering::Release);
            match upstream.sync().await {
                Ok(outcome) => tracing::info!(?outcome, "Resync finished"),
                Err(e) => tracing::error!(error = %e, "Resync failed"),
            }
        });
        true
    }

    /// Whether a resync is waiting for its delay.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Cancel any pending resync and wait for a running one to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

//! Application state shared across handlers.

use crate::archive::ArchiveBuilder;
use crate::janitor::Janitor;
use crate::mirror::{ResyncTrigger, Upstream};
use crate::ratelimit::RateLimitState;
use crate::reclaim::Reclaimer;
use crate::registry::ChunkRegistry;
use patcher_core::config::AppConfig;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared application state.
///
/// Owns every background unit of the server. Periodic tasks are started by
/// [`spawn_background`](Self::spawn_background) and everything is torn down by
/// [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Handle to file list mapping for planned chunks.
    pub registry: ChunkRegistry,
    /// Builds scratch archives on download.
    pub archives: Arc<ArchiveBuilder>,
    /// Deletes served archives after the reclaim delay.
    pub reclaimer: Reclaimer,
    /// Expires chunks that were never downloaded.
    pub janitor: Arc<Janitor>,
    /// Rate limiting state for the planning endpoint.
    pub rate_limit: RateLimitState,
    /// Debounced upstream resync.
    pub resync: ResyncTrigger,
    shutdown: CancellationToken,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AppState {
    /// Create a new application state.
    ///
    /// Validates the configuration, logging warnings for risky settings and
    /// failing on invalid ones.
    pub fn new(config: AppConfig, upstream: Arc<dyn Upstream>) -> patcher_core::Result<Self> {
        for warning in config.validate()? {
            tracing::warn!("Configuration warning: {}", warning);
        }

        let shutdown = CancellationToken::new();
        let registry = ChunkRegistry::new();
        let archives = Arc::new(ArchiveBuilder::new(
            config.mirror.root.clone(),
            config.chunks.scratch_dir.clone(),
        ));
        let reclaimer = Reclaimer::new(config.chunks.reclaim_delay(), shutdown.child_token());
        let janitor = Arc::new(Janitor::new(
            registry.clone(),
            config.chunks.scratch_dir.clone(),
            config.chunks.max_age(),
        ));
        let rate_limit = RateLimitState::new(&config.rate_limit);
        let resync = ResyncTrigger::new(
            upstream,
            config.mirror.resync_delay(),
            shutdown.child_token(),
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            archives,
            reclaimer,
            janitor,
            rate_limit,
            resync,
            shutdown,
            background: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Get the cleanup interval for the rate limiter, if enabled.
    pub fn rate_limit_cleanup_interval(&self) -> Option<Duration> {
        self.rate_limit
            .is_enabled()
            .then(|| self.config.rate_limit.cleanup_interval())
    }

    /// Start the janitor and the rate limiter cleanup task.
    pub fn spawn_background(&self) {
        let mut handles = Vec::new();

        let interval = self.config.chunks.sweep_interval();
        handles.push(
            self.janitor
                .clone()
                .spawn(interval, self.shutdown.child_token()),
        );
        tracing::info!(
            interval_secs = interval.as_secs(),
            max_age_secs = self.config.chunks.max_age_secs,
            "Expiry janitor spawned"
        );

        if let Some(cleanup_interval) = self.rate_limit_cleanup_interval() {
            handles.push(crate::ratelimit::spawn_cleanup_task(
                self.rate_limit.clone(),
                cleanup_interval,
                self.shutdown.child_token(),
            ));
            tracing::info!(
                interval_secs = cleanup_interval.as_secs(),
                "Rate limiter cleanup task spawned"
            );
        }

        self.background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(handles);
    }

    /// Stop background tasks and run every pending reclaim immediately.
    pub async fn shutdown(&self) {
        tracing::info!(
            pending_reclaims = self.reclaimer.pending(),
            "Shutting down background tasks"
        );
        self.shutdown.cancel();

        let handles: Vec<_> = self
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.reclaimer.shutdown().await;
        self.resync.shutdown().await;
    }
}

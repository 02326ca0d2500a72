//! Periodic expiry of chunks that were planned but never downloaded.
//!
//! Each sweep does two independent passes: registry entries older than the
//! maximum age are dropped along with their scratch archives, then any `.zip`
//! in the scratch directory older than the maximum age is removed regardless
//! of the registry. The second pass catches archives orphaned by a crash or a
//! reclaim that never ran.

use crate::registry::ChunkRegistry;
use patcher_core::ChunkHandle;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result of a single sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Registry entries removed for exceeding the maximum age.
    pub expired_entries: usize,
    /// Scratch archives deleted.
    pub removed_files: usize,
}

/// Expires registry entries and stale scratch archives.
pub struct Janitor {
    registry: ChunkRegistry,
    scratch_dir: PathBuf,
    max_age: Duration,
}

impl Janitor {
    pub fn new(registry: ChunkRegistry, scratch_dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            registry,
            scratch_dir: scratch_dir.into(),
            max_age,
        }
    }

    /// Run one sweep with `now` as the reference time.
    pub async fn sweep(&self, now: OffsetDateTime) -> SweepStats {
        let cutoff = now - self.max_age;

        // The registry lock is released before any file is touched.
        let expired = self.registry.drain_expired(cutoff);
        for _ in &expired {
            crate::metrics::record_reclaimed("expired");
        }

        let removed_files = self.sweep_scratch_dir(&expired, cutoff).await;

        let stats = SweepStats {
            expired_entries: expired.len(),
            removed_files,
        };
        if stats != SweepStats::default() {
            tracing::info!(
                expired_entries = stats.expired_entries,
                removed_files = stats.removed_files,
                "Janitor sweep reclaimed chunks"
            );
        }
        stats
    }

    async fn sweep_scratch_dir(&self, expired: &[ChunkHandle], cutoff: OffsetDateTime) -> usize {
        let mut dir = match tokio::fs::read_dir(&self.scratch_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::warn!(dir = %self.scratch_dir.display(), error = %e, "Failed to read scratch directory");
                return 0;
            }
        };

        let prefixes: Vec<String> = expired.iter().map(ChunkHandle::scratch_prefix).collect();
        let cutoff = SystemTime::from(cutoff);
        let mut removed = 0;

        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read scratch directory entry");
                    break;
                }
            };

            let path = entry.path();
            if !is_zip(&path) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();

            let belongs_to_expired = prefixes.iter().any(|prefix| name.starts_with(prefix));
            let stale = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta.modified().is_ok_and(|mtime| mtime < cutoff),
                _ => continue,
            };

            if (belongs_to_expired || stale) && crate::reclaim::remove_scratch_file(&path).await {
                tracing::debug!(path = %path.display(), "Janitor removed scratch archive");
                removed += 1;
            }
        }

        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                self.sweep(OffsetDateTime::now_utc()).await;
            }
            tracing::debug!("Janitor stopped");
        })
    }
}

fn is_zip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "zip")
}

#[cfg(test)]
mod tests {
    use super::*;
    use patcher_core::{FileEntry, pack};
    use tempfile::tempdir;

    fn one_chunk() -> Vec<patcher_core::Chunk> {
        pack(vec![FileEntry::new("a.txt", 1)], 100)
    }

    #[tokio::test]
    async fn sweep_expires_undownloaded_entries_and_their_archives() {
        let temp = tempdir().unwrap();
        let registry = ChunkRegistry::new();
        let now = OffsetDateTime::now_utc();

        let old = registry.register_at(&one_chunk(), now - Duration::from_secs(120));
        let fresh = registry.register_at(&one_chunk(), now);

        // Scratch archive for the expired handle, freshly written.
        let old_zip = temp.path().join(format!("{}abc123.zip", old[0].scratch_prefix()));
        std::fs::write(&old_zip, b"zip").unwrap();
        let fresh_zip = temp.path().join(format!("{}def456.zip", fresh[0].scratch_prefix()));
        std::fs::write(&fresh_zip, b"zip").unwrap();

        let janitor = Janitor::new(registry.clone(), temp.path(), Duration::from_secs(60));
        let stats = janitor.sweep(now).await;

        assert_eq!(
            stats,
            SweepStats {
                expired_entries: 1,
                removed_files: 1
            }
        );
        assert!(registry.resolve(&old[0]).is_none());
        assert!(registry.resolve(&fresh[0]).is_some());
        assert!(!old_zip.exists());
        assert!(fresh_zip.exists());
    }

    #[tokio::test]
    async fn sweep_removes_stale_orphan_archives_only() {
        let temp = tempdir().unwrap();
        let orphan = temp.path().join("1-0-xyz.zip");
        let notes = temp.path().join("notes.txt");
        std::fs::write(&orphan, b"zip").unwrap();
        std::fs::write(&notes, b"keep").unwrap();

        let janitor = Janitor::new(ChunkRegistry::new(), temp.path(), Duration::from_secs(60));

        // Files were just written, so they are fresh relative to now.
        let stats = janitor.sweep(OffsetDateTime::now_utc()).await;
        assert_eq!(stats.removed_files, 0);
        assert!(orphan.exists());

        // Two minutes later the orphan is stale; non-zip files are never touched.
        let later = OffsetDateTime::now_utc() + Duration::from_secs(120);
        let stats = janitor.sweep(later).await;
        assert_eq!(stats.removed_files, 1);
        assert!(!orphan.exists());
        assert!(notes.exists());
    }

    #[tokio::test]
    async fn sweep_prefix_does_not_match_longer_index() {
        let temp = tempdir().unwrap();
        let registry = ChunkRegistry::new();
        let now = OffsetDateTime::now_utc();
        let old = registry.register_at(&one_chunk(), now - Duration::from_secs(120));

        let stamp = old[0].stamp();
        let other = temp.path().join(format!("{stamp}-10-abc.zip"));
        std::fs::write(&other, b"zip").unwrap();

        let janitor = Janitor::new(registry, temp.path(), Duration::from_secs(60));
        janitor.sweep(now).await;
        assert!(other.exists());
    }

    #[tokio::test]
    async fn sweep_with_missing_scratch_dir_is_empty() {
        let temp = tempdir().unwrap();
        let janitor = Janitor::new(
            ChunkRegistry::new(),
            temp.path().join("never-created"),
            Duration::from_secs(60),
        );
        assert_eq!(janitor.sweep(OffsetDateTime::now_utc()).await, SweepStats::default());
    }

    #[tokio::test]
    async fn spawned_janitor_sweeps_and_stops_on_cancel() {
        let temp = tempdir().unwrap();
        let registry = ChunkRegistry::new();
        registry.register(&one_chunk());

        let janitor = Arc::new(Janitor::new(registry.clone(), temp.path(), Duration::ZERO));
        let cancel = CancellationToken::new();
        let handle = janitor.spawn(Duration::from_millis(20), cancel.clone());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("janitor should stop after cancel")
            .unwrap();
    }
}

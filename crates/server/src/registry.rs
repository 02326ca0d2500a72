//! In-memory registry of planned chunks.
//!
//! The registry is the authoritative record of what a handle means. Every
//! operation takes the lock only for the map access itself; callers do their
//! file I/O after the guard is released.

use patcher_core::{Chunk, ChunkHandle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use time::OffsetDateTime;

/// A registered chunk: the files it packs and when it was planned.
#[derive(Clone, Debug)]
pub struct RegistryEntry {
    /// Relative paths under the mirror root, in archive order.
    pub files: Vec<String>,
    /// Planning time, used by the janitor to expire undownloaded chunks.
    pub created_at: OffsetDateTime,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<ChunkHandle, RegistryEntry>,
    /// Last stamp handed out. New stamps are strictly greater.
    last_stamp: i128,
}

/// Shared handle to the chunk registry.
#[derive(Clone, Default)]
pub struct ChunkRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ChunkRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("chunk registry mutex was poisoned, recovering with into_inner()");
            poisoned.into_inner()
        })
    }

    /// Register the chunks of one planning call, returning one handle per chunk in order.
    pub fn register(&self, chunks: &[Chunk]) -> Vec<ChunkHandle> {
        self.register_at(chunks, OffsetDateTime::now_utc())
    }

    /// Register chunks as if planned at `now`.
    ///
    /// All handles of the call share one stamp. The stamp is the wall clock in
    /// nanoseconds, bumped past the previous call's stamp when the clock has
    /// not advanced, so handles never repeat within the process.
    pub fn register_at(&self, chunks: &[Chunk], now: OffsetDateTime) -> Vec<ChunkHandle> {
        if chunks.is_empty() {
            return Vec::new();
        }

        let file_lists: Vec<Vec<String>> = chunks.iter().map(Chunk::paths).collect();

        let mut inner = self.lock();
        let stamp = now
            .unix_timestamp_nanos()
            .max(inner.last_stamp.saturating_add(1));
        inner.last_stamp = stamp;

        let handles = file_lists
            .into_iter()
            .enumerate()
            .map(|(index, files)| {
                let handle = ChunkHandle::new(stamp, index as u32);
                inner.entries.insert(
                    handle,
                    RegistryEntry {
                        files,
                        created_at: now,
                    },
                );
                handle
            })
            .collect();

        crate::metrics::REGISTERED_CHUNKS.set(inner.entries.len() as i64);
        handles
    }

    /// Look up the files of a handle.
    pub fn resolve(&self, handle: &ChunkHandle) -> Option<Vec<String>> {
        self.lock().entries.get(handle).map(|e| e.files.clone())
    }

    /// Remove a handle. Removing an unknown handle is a no-op; returns whether an entry existed.
    pub fn remove(&self, handle: &ChunkHandle) -> bool {
        let mut inner = self.lock();
        let removed = inner.entries.remove(handle).is_some();
        crate::metrics::REGISTERED_CHUNKS.set(inner.entries.len() as i64);
        removed
    }

    /// Remove every entry planned strictly before `cutoff`, returning the removed handles.
    pub fn drain_expired(&self, cutoff: OffsetDateTime) -> Vec<ChunkHandle> {
        let mut inner = self.lock();
        let mut expired = Vec::new();
        inner.entries.retain(|handle, entry| {
            let keep = entry.created_at >= cutoff;
            if !keep {
                expired.push(*handle);
            }
            keep
        });
        crate::metrics::REGISTERED_CHUNKS.set(inner.entries.len() as i64);
        expired
    }

    /// Number of registered chunks.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

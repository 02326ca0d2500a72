//! Chunk planning against the mirror root.

use patcher_core::{Chunk, FileEntry, pack, sanitize_relative};
use std::path::Path;

/// Stat each requested path under `root`, keeping regular files in request order.
///
/// Missing paths, directories, unsafe paths and symlinks that resolve outside
/// the root are dropped without error.
pub async fn collect_entries(root: &Path, paths: &[String]) -> Vec<FileEntry> {
    let root_canonical = match tokio::fs::canonicalize(root).await {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(root = %root.display(), error = %e, "Mirror root unavailable, planning nothing");
            return Vec::new();
        }
    };

    let mut entries = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(relative) = sanitize_relative(path) else {
            tracing::debug!(path = %path, "Skipping unsafe path");
            continue;
        };

        let full = root_canonical.join(&relative);
        let resolved = match tokio::fs::canonicalize(&full).await {
            Ok(resolved) => resolved,
            Err(_) => continue,
        };
        if !resolved.starts_with(&root_canonical) {
            tracing::debug!(path = %path, "Skipping path that resolves outside the mirror root");
            continue;
        }

        match tokio::fs::metadata(&resolved).await {
            Ok(meta) if meta.is_file() => entries.push(FileEntry::new(path.clone(), meta.len())),
            _ => {}
        }
    }

    entries
}

/// Plan the requested files into chunks of at most `budget` bytes.
pub async fn plan(root: &Path, paths: &[String], budget: u64) -> Vec<Chunk> {
    pack(collect_entries(root, paths).await, budget)
}

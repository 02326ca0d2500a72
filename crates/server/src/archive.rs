//! Materialization of chunk archives on scratch storage.
//!
//! Each GET builds a fresh zip of the chunk's files under the scratch
//! directory. The archive is finalized before any byte is streamed, so a
//! client always receives a complete archive. Files that cannot be read at
//! build time are left out rather than failing the whole archive.

use patcher_core::{ChunkHandle, sanitize_relative};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Entries at or above this size need zip64 extensions.
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Archive build failures. Per-file read errors are not failures.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive task failed: {0}")]
    Task(String),
}

/// A finalized archive on scratch storage.
#[derive(Debug)]
pub struct BuiltArchive {
    /// Location of the scratch file.
    pub path: PathBuf,
    /// Size of the archive in bytes.
    pub size: u64,
    /// Number of files written into the archive.
    pub entries: usize,
    /// Registered files that could not be read.
    pub skipped: Vec<String>,
}

/// Builds chunk archives from files under the mirror root.
pub struct ArchiveBuilder {
    root: PathBuf,
    scratch_dir: PathBuf,
}

impl ArchiveBuilder {
    /// Create a builder reading from `root` and writing into `scratch_dir`.
    pub fn new(root: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Build the archive for `handle` containing `files`, in order.
    #[tracing::instrument(skip(self, files), fields(handle = %handle, files = files.len()))]
    pub async fn build(
        &self,
        handle: ChunkHandle,
        files: Vec<String>,
    ) -> Result<BuiltArchive, ArchiveError> {
        let root = self.root.clone();
        let scratch_dir = self.scratch_dir.clone();
        let started = Instant::now();

        let archive = tokio::task::spawn_blocking(move || {
            build_blocking(&root, &scratch_dir, handle, &files)
        })
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))??;

        crate::metrics::ARCHIVE_BUILD_DURATION.observe(started.elapsed().as_secs_f64());
        crate::metrics::ARCHIVE_FILES_SKIPPED.inc_by(archive.skipped.len() as u64);

        if !archive.skipped.is_empty() {
            tracing::warn!(
                skipped = ?archive.skipped,
                "Some registered files were unreadable and left out of the archive"
            );
        }
        tracing::info!(
            path = %archive.path.display(),
            entries = archive.entries,
            size = archive.size,
            "Chunk archive built"
        );

        Ok(archive)
    }
}

fn build_blocking(
    root: &Path,
    scratch_dir: &Path,
    handle: ChunkHandle,
    files: &[String],
) -> Result<BuiltArchive, ArchiveError> {
    std::fs::create_dir_all(scratch_dir)?;

    // Removed automatically if anything below fails before `keep`.
    let scratch = tempfile::Builder::new()
        .prefix(&handle.scratch_prefix())
        .suffix(".zip")
        .tempfile_in(scratch_dir)?;

    let mut writer = ZipWriter::new(BufWriter::new(scratch.as_file()));
    let mut written = HashSet::new();
    let mut skipped = Vec::new();

    for name in files {
        let Some(relative) = sanitize_relative(name) else {
            skipped.push(name.clone());
            continue;
        };
        // Zip entry names must be unique; a repeated path keeps its first entry.
        if written.contains(name.as_str()) {
            tracing::debug!(file = %name, "Skipping repeated file");
            skipped.push(name.clone());
            continue;
        }

        let mut source = match File::open(root.join(&relative)) {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!(file = %name, error = %e, "Skipping unreadable file");
                skipped.push(name.clone());
                continue;
            }
        };

        let size = source.metadata().map(|m| m.len()).unwrap_or(0);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(size >= ZIP64_THRESHOLD);

        writer.start_file(name.as_str(), options)?;
        if let Err(e) = std::io::copy(&mut source, &mut writer) {
            tracing::debug!(file = %name, error = %e, "File became unreadable mid-copy, dropping entry");
            writer.abort_file()?;
            skipped.push(name.clone());
            continue;
        }
        written.insert(name.as_str());
    }

    writer.finish()?.flush()?;

    let (file, path) = scratch.keep().map_err(|e| ArchiveError::Io(e.error))?;
    let size = file.metadata()?.len();

    Ok(BuiltArchive {
        path,
        size,
        entries: written.len(),
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    fn read_archive(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut entry = archive.by_index(i).unwrap();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (entry.name().to_string(), data)
            })
            .collect()
    }

    #[tokio::test]
    async fn build_writes_valid_zip_with_files_in_order() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("mirror");
        std::fs::create_dir_all(root.join("maps")).unwrap();
        std::fs::write(root.join("eqgame.exe"), b"binary").unwrap();
        std::fs::write(root.join("maps/qeynos.eqg"), vec![7u8; 4096]).unwrap();

        let builder = ArchiveBuilder::new(&root, temp.path().join("scratch"));
        let handle = ChunkHandle::new(42, 0);
        let archive = builder
            .build(
                handle,
                vec!["eqgame.exe".to_string(), "maps/qeynos.eqg".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(archive.entries, 2);
        assert!(archive.skipped.is_empty());
        assert!(archive.path.starts_with(temp.path().join("scratch")));
        let file_name = archive.path.file_name().unwrap().to_string_lossy();
        assert!(file_name.starts_with("42-0-"));
        assert!(file_name.ends_with(".zip"));
        assert_eq!(std::fs::metadata(&archive.path).unwrap().len(), archive.size);

        let contents = read_archive(&archive.path);
        assert_eq!(contents[0], ("eqgame.exe".to_string(), b"binary".to_vec()));
        assert_eq!(contents[1], ("maps/qeynos.eqg".to_string(), vec![7u8; 4096]));
    }

    #[tokio::test]
    async fn build_skips_unreadable_files_and_keeps_the_rest() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("mirror");
        std::fs::create_dir_all(root.join("dir")).unwrap();
        std::fs::write(root.join("keep.txt"), b"kept").unwrap();

        let builder = ArchiveBuilder::new(&root, temp.path().join("scratch"));
        let archive = builder
            .build(
                ChunkHandle::new(7, 1),
                vec![
                    "deleted-after-planning.txt".to_string(),
                    "dir".to_string(),
                    "keep.txt".to_string(),
                    "../escape.txt".to_string(),
                ],
            )
            .await
            .unwrap();

        assert_eq!(archive.entries, 1);
        assert_eq!(archive.skipped.len(), 3);
        let contents = read_archive(&archive.path);
        assert_eq!(contents, vec![("keep.txt".to_string(), b"kept".to_vec())]);
    }

    #[tokio::test]
    async fn build_with_no_readable_files_is_still_a_valid_archive() {
        let temp = tempdir().unwrap();
        let builder = ArchiveBuilder::new(temp.path(), temp.path().join("scratch"));
        let archive = builder
            .build(ChunkHandle::new(9, 0), vec!["nope".to_string()])
            .await
            .unwrap();

        assert_eq!(archive.entries, 0);
        assert!(read_archive(&archive.path).is_empty());
    }

    #[tokio::test]
    async fn build_writes_a_repeated_file_once() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("a.txt"), b"a").unwrap();
        let builder = ArchiveBuilder::new(temp.path(), temp.path().join("scratch"));

        let archive = builder
            .build(
                ChunkHandle::new(3, 0),
                vec!["a.txt".to_string(), "a.txt".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(archive.entries, 1);
        assert_eq!(archive.skipped, vec!["a.txt".to_string()]);
        assert_eq!(
            read_archive(&archive.path),
            vec![("a.txt".to_string(), b"a".to_vec())]
        );
    }

    #[tokio::test]
    async fn each_build_creates_a_distinct_scratch_file() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("a"), b"a").unwrap();
        let builder = ArchiveBuilder::new(temp.path(), temp.path().join("scratch"));
        let handle = ChunkHandle::new(1, 0);

        let first = builder.build(handle, vec!["a".to_string()]).await.unwrap();
        let second = builder.build(handle, vec!["a".to_string()]).await.unwrap();
        assert_ne!(first.path, second.path);
    }
}

//! File entries, size-bounded chunks and the packing algorithm.

use serde::{Deserialize, Serialize};

/// A requested file that exists under the mirror root, with its size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the mirror root, as the client sent it.
    pub path: String,
    /// Size in bytes at planning time.
    pub size: u64,
}

impl FileEntry {
    /// Create a new file entry.
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

/// An ordered, non-empty group of files packaged together as one archive.
///
/// Either the total size fits the budget the chunk was packed with, or the
/// chunk holds exactly one file that is larger than the budget on its own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    files: Vec<FileEntry>,
    total_size: u64,
}

impl Chunk {
    fn start(entry: FileEntry) -> Self {
        Self {
            total_size: entry.size,
            files: vec![entry],
        }
    }

    fn push(&mut self, entry: FileEntry) {
        self.total_size = self.total_size.saturating_add(entry.size);
        self.files.push(entry);
    }

    /// Files in this chunk, in request order.
    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Number of files in this chunk.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Sum of the uncompressed file sizes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Relative paths of the files, in order.
    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

/// Resolve a client-supplied budget. Absent or non-positive values fall back to `default`.
pub fn effective_budget(requested: Option<i64>, default: u64) -> u64 {
    match requested {
        Some(budget) if budget > 0 => budget as u64,
        _ => default,
    }
}

/// Partition `entries` into ordered chunks whose totals stay within `budget`.
///
/// A new chunk is started only when the next entry would push a non-empty
/// chunk over the budget, so an entry larger than the budget always ends up
/// alone. A zero budget is treated as the crate default.
pub fn pack(entries: impl IntoIterator<Item = FileEntry>, budget: u64) -> Vec<Chunk> {
    let budget = if budget == 0 {
        crate::DEFAULT_MAX_CHUNK_SIZE
    } else {
        budget
    };

    let mut chunks = Vec::new();
    let mut current: Option<Chunk> = None;

    for entry in entries {
        match current.as_mut() {
            Some(chunk) if chunk.total_size.saturating_add(entry.size) <= budget => {
                chunk.push(entry);
            }
            Some(_) => {
                chunks.extend(current.replace(Chunk::start(entry)));
            }
            None => current = Some(Chunk::start(entry)),
        }
    }

    chunks.extend(current);
    chunks
}

//! Core domain types for the patch mirror.
//!
//! This crate defines the data model shared by the server:
//! - File entries and size-bounded chunks, plus the packing algorithm
//! - Chunk handles (time-stamped identifiers for registered chunks)
//! - Relative path sanitizing against the mirrored root
//! - Typed configuration sections

pub mod chunk;
pub mod config;
pub mod error;
pub mod handle;
pub mod path;

pub use chunk::{Chunk, FileEntry, effective_budget, pack};
pub use error::{Error, Result};
pub use handle::ChunkHandle;
pub use path::sanitize_relative;

/// Default chunk budget when a request omits one or sends a non-positive value: 30 MiB.
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 30 * 1024 * 1024;

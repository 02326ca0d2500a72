//! Chunk handles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier for one registered chunk, rendered as `"<stamp>-<index>"`.
///
/// `stamp` is the nanosecond UNIX timestamp of the planning call that produced
/// the chunk and `index` its position within that call. All chunks of one call
/// share a stamp; the registry guarantees stamps never repeat across calls.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkHandle {
    stamp: i128,
    index: u32,
}

impl ChunkHandle {
    /// Create a handle from its parts.
    pub fn new(stamp: i128, index: u32) -> Self {
        Self { stamp, index }
    }

    /// Nanosecond timestamp shared by every chunk of the planning call.
    pub fn stamp(&self) -> i128 {
        self.stamp
    }

    /// Position of the chunk within its planning call.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// File name prefix of scratch archives built for this handle.
    ///
    /// The trailing dash keeps `1-1` from matching archives of `1-10`.
    pub fn scratch_prefix(&self) -> String {
        format!("{self}-")
    }
}

impl fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHandle({self})")
    }
}

impl fmt::Display for ChunkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.stamp, self.index)
    }
}

impl FromStr for ChunkHandle {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let invalid = || crate::Error::InvalidHandle(s.to_string());

        let (stamp, index) = s.split_once('-').ok_or_else(invalid)?;
        // Canonical decimal only, so every handle has exactly one spelling.
        let digits = |part: &str| {
            !part.is_empty()
                && part.bytes().all(|b| b.is_ascii_digit())
                && (part == "0" || !part.starts_with('0'))
        };
        if !digits(stamp) || !digits(index) {
            return Err(invalid());
        }

        Ok(Self {
            stamp: stamp.parse().map_err(|_| invalid())?,
            index: index.parse().map_err(|_| invalid())?,
        })
    }
}

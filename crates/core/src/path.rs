//! Relative path handling for files under the mirror root.

use std::path::{Component, Path, PathBuf};

/// Validate a client-supplied relative path.
///
/// Returns `None` for empty or absolute paths and for paths with any
/// component other than a plain name (`..`, `.`, roots, drive prefixes), so a
/// sanitized path joined onto the root can never leave it.
pub fn sanitize_relative(path: &str) -> Option<PathBuf> {
    if path.is_empty() || path.starts_with('/') || path.starts_with('\\') {
        return None;
    }

    let candidate = Path::new(path);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            _ => return None,
        }
    }

    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

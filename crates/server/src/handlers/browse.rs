//! Directory listings for the mirror root.
//!
//! Files are served by `ServeDir`; this handler is its fallback and renders an
//! index for directories that have no `index.html`.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::State;
use axum::http::Uri;
use axum::response::Html;
use patcher_core::sanitize_relative;
use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use std::fmt::Write;
use std::path::PathBuf;

/// One row of a directory listing.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Listed {
    name: String,
    is_dir: bool,
}

/// GET on a mirror directory - Render its contents as HTML.
#[tracing::instrument(skip(state), fields(path = %uri.path()))]
pub async fn list_directory(State(state): State<AppState>, uri: Uri) -> ApiResult<Html<String>> {
    let not_found = || ApiError::NotFound(format!("not found: {}", uri.path()));

    let decoded = percent_decode_str(uri.path())
        .decode_utf8()
        .map_err(|_| not_found())?;
    let trimmed = decoded.trim_matches('/');

    let root = tokio::fs::canonicalize(&state.config.mirror.root)
        .await
        .map_err(|_| not_found())?;
    let requested = if trimmed.is_empty() {
        root.clone()
    } else {
        root.join(sanitize_relative(trimmed).ok_or_else(not_found)?)
    };

    // Symlinks may point anywhere; only list what resolves inside the root.
    let resolved = tokio::fs::canonicalize(&requested)
        .await
        .map_err(|_| not_found())?;
    if !resolved.starts_with(&root) || !tokio::fs::metadata(&resolved).await?.is_dir() {
        return Err(not_found());
    }

    let entries = read_listing(resolved).await?;
    tracing::debug!(entries = entries.len(), "Rendering directory listing");

    Ok(Html(render(&format!("/{trimmed}"), !trimmed.is_empty(), &entries)))
}

async fn read_listing(dir: PathBuf) -> std::io::Result<Vec<Listed>> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        // Repository metadata such as .git stays out of listings.
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        entries.push(Listed { name, is_dir });
    }
    entries.sort();
    Ok(entries)
}

fn render(path: &str, has_parent: bool, entries: &[Listed]) -> String {
    let title = if path.ends_with('/') {
        escape_html(path)
    } else {
        escape_html(&format!("{path}/"))
    };
    let mut html = format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>Index of {title}</title></head>\n\
         <body><h1>Index of {title}</h1>\n<pre>\n"
    );
    if has_parent {
        html.push_str("<a href=\"../\">../</a>\n");
    }
    for entry in entries {
        let slash = if entry.is_dir { "/" } else { "" };
        let _ = writeln!(
            html,
            "<a href=\"{}{slash}\">{}{slash}</a>",
            utf8_percent_encode(&entry.name, NON_ALPHANUMERIC),
            escape_html(&entry.name),
        );
    }
    html.push_str("</pre></body></html>\n");
    html
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_directories_with_trailing_slash() {
        let entries = vec![
            Listed {
                name: "maps".into(),
                is_dir: true,
            },
            Listed {
                name: "a b.txt".into(),
                is_dir: false,
            },
        ];
        let html = render("/patch", true, &entries);

        assert!(html.contains("<title>Index of /patch/</title>"));
        assert!(html.contains("<a href=\"../\">../</a>"));
        assert!(html.contains("<a href=\"maps/\">maps/</a>"));
        assert!(html.contains("<a href=\"a%20b%2Etxt\">a b.txt</a>"));
    }

    #[test]
    fn test_render_root_has_no_parent_link() {
        let html = render("/", false, &[]);
        assert!(html.contains("Index of /<"));
        assert!(!html.contains("../"));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a&b>\"'"), "&lt;a&amp;b&gt;&quot;&#39;");
    }
}

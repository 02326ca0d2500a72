//! Chunk planning and archive download endpoints.

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::planner;
use crate::state::AppState;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use patcher_core::{Chunk, ChunkHandle, effective_budget};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

/// Planning request body.
#[derive(Debug, Deserialize)]
pub struct InitRequest {
    /// Paths relative to the mirror root.
    #[serde(default)]
    pub files: Vec<String>,
    /// Byte budget per chunk. Absent or non-positive uses the server default.
    #[serde(default)]
    pub max_chunk_size: Option<i64>,
}

/// One planned chunk.
#[derive(Debug, Serialize)]
pub struct ChunkDescriptor {
    /// Download URL for the chunk archive.
    pub url: String,
    pub file_count: usize,
    pub total_size_uncompressed: u64,
}

/// Planning response body.
#[derive(Debug, Serialize)]
pub struct InitResponse {
    pub chunks: Vec<ChunkDescriptor>,
}

fn describe(handle: ChunkHandle, chunk: &Chunk) -> ChunkDescriptor {
    ChunkDescriptor {
        url: format!("/zip-chunks/{handle}"),
        file_count: chunk.file_count(),
        total_size_uncompressed: chunk.total_size(),
    }
}

/// POST /zip-chunks/init - Plan the requested files into downloadable chunks.
#[tracing::instrument(skip(state, req), fields(requested, chunks))]
pub async fn init_chunks(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<InitResponse>> {
    let body: InitRequest = {
        let bytes = axum::body::to_bytes(req.into_body(), state.config.server.max_request_bytes)
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?
    };

    let budget = effective_budget(
        body.max_chunk_size,
        state.config.chunks.default_max_chunk_size,
    );
    let chunks = planner::plan(&state.config.mirror.root, &body.files, budget).await;
    let handles = state.registry.register(&chunks);

    let span = tracing::Span::current();
    span.record("requested", body.files.len());
    span.record("chunks", chunks.len());

    metrics::PLANS_CREATED.inc();
    metrics::CHUNKS_REGISTERED.inc_by(handles.len() as u64);
    tracing::info!(budget, "Chunk plan registered");

    Ok(Json(InitResponse {
        chunks: handles
            .into_iter()
            .zip(&chunks)
            .map(|(handle, chunk)| describe(handle, chunk))
            .collect(),
    }))
}

/// GET /zip-chunks/{handle} - Build and stream the archive for a planned chunk.
///
/// The scratch archive is reclaimed a fixed delay after the response body is
/// dropped, whether the download completed or not.
#[tracing::instrument(skip(state))]
pub async fn get_chunk(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> ApiResult<Response> {
    let not_found = || ApiError::NotFound(format!("chunk not found: {handle}"));
    let parsed: ChunkHandle = handle.parse().map_err(|_| not_found())?;
    let files = state.registry.resolve(&parsed).ok_or_else(not_found)?;

    let archive = state.archives.build(parsed, files).await?;

    let registry = state.registry.clone();
    let guard = state.reclaimer.guard(archive.path.clone(), move || {
        if registry.remove(&parsed) {
            metrics::record_reclaimed("download");
        }
    });

    // On error the guard is dropped here and still schedules the cleanup.
    let file = tokio::fs::File::open(&archive.path).await?;
    // The body stream owns the guard, so cleanup is tied to the body's drop.
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _owned = &guard;
        chunk
    });

    metrics::ARCHIVES_SERVED.inc();

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, "application/zip".to_string()),
            (CONTENT_LENGTH, archive.size.to_string()),
            (
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{parsed}.zip\""),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

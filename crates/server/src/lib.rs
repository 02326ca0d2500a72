//! HTTP server for distributing a mirrored patch tree in zip chunks.
//!
//! This crate provides:
//! - Chunk planning against the mirror root and a registry of planned chunks
//! - On-demand archive building with deferred reclamation after download
//! - Periodic expiry of chunks that are never downloaded
//! - Per-IP rate limiting of planning requests
//! - Upstream sync and a webhook to trigger it

pub mod archive;
pub mod error;
pub mod handlers;
pub mod janitor;
pub mod metrics;
pub mod mirror;
pub mod planner;
pub mod ratelimit;
pub mod reclaim;
pub mod registry;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use mirror::{GitUpstream, Upstream};
pub use ratelimit::RateLimitState;
pub use registry::ChunkRegistry;
pub use routes::create_router;
pub use state::AppState;

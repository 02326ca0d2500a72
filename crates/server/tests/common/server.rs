//! Server test utilities.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request, StatusCode};
use patcher_core::config::AppConfig;
use patcher_server::mirror::Upstream;
use patcher_server::{AppState, GitUpstream, create_router};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// A test server wrapper with a temporary mirror root and scratch directory.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub root: PathBuf,
    pub scratch_dir: PathBuf,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with default configuration.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Create a test server with custom config modifications.
    pub fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let root = temp_dir.path().join("mirror");
        let scratch_dir = temp_dir.path().join("scratch");
        std::fs::create_dir_all(&root).expect("Failed to create mirror root");

        let mut config = AppConfig::for_testing(&root, &scratch_dir);
        modifier(&mut config);

        patcher_server::metrics::register_metrics();

        // No repo configured, so syncs are no-ops.
        let upstream: Arc<dyn Upstream> = Arc::new(GitUpstream::new(&root, None));
        let state = AppState::new(config, upstream).expect("Invalid test configuration");
        let router = create_router(state.clone());

        Self {
            router,
            state,
            root,
            scratch_dir,
            _temp_dir: temp_dir,
        }
    }

    /// Write a file under the mirror root, creating parent directories.
    pub fn write_file(&self, relative: &str, contents: &[u8]) {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        std::fs::write(path, contents).expect("Failed to write mirror file");
    }

    /// Path of a file under the mirror root.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Zip files currently in the scratch directory.
    pub fn scratch_archives(&self) -> Vec<PathBuf> {
        scratch_archives(&self.scratch_dir)
    }

    /// Send a request through the router and collect the response.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body.to_vec())
    }

    /// POST /zip-chunks/init from the given client address.
    pub async fn init_from(
        &self,
        client: &str,
        files: &[&str],
        max_chunk_size: Option<i64>,
    ) -> (StatusCode, Value) {
        let mut body = json!({ "files": files });
        if let Some(max) = max_chunk_size {
            body["max_chunk_size"] = json!(max);
        }

        let mut request = Request::builder()
            .method("POST")
            .uri("/zip-chunks/init")
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let addr: SocketAddr = format!("{client}:50000").parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));

        let (status, _, bytes) = self.send(request).await;
        (status, parse_json(&bytes))
    }

    /// POST /zip-chunks/init from a default client.
    pub async fn init(&self, files: &[&str], max_chunk_size: Option<i64>) -> (StatusCode, Value) {
        self.init_from("192.0.2.1", files, max_chunk_size).await
    }

    /// Plain GET request.
    pub async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, Vec<u8>) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        self.send(request).await
    }

    /// Plain POST request without a body, returning parsed JSON.
    pub async fn post(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let (status, _, bytes) = self.send(request).await;
        (status, parse_json(&bytes))
    }
}

fn parse_json(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(bytes).unwrap_or(Value::Null)
    }
}

/// Zip files in `dir`; a missing directory has none.
#[allow(dead_code)]
pub fn scratch_archives(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "zip"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

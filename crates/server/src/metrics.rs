//! Prometheus metrics for the patch server.
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! Metrics carry no file names or client addresses, only aggregate counts.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static PLANS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "patcher_plans_created_total",
        "Total number of chunk plans created",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_REGISTERED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "patcher_chunks_registered_total",
        "Total number of chunk handles registered",
    )
    .expect("metric creation failed")
});

pub static REGISTERED_CHUNKS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "patcher_registered_chunks",
        "Current number of chunk handles in the registry",
    )
    .expect("metric creation failed")
});

pub static ARCHIVES_SERVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "patcher_archives_served_total",
        "Total number of chunk archives built and streamed",
    )
    .expect("metric creation failed")
});

pub static ARCHIVE_FILES_SKIPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "patcher_archive_files_skipped_total",
        "Total number of registered files left out of archives because they were unreadable",
    )
    .expect("metric creation failed")
});

pub static ARCHIVE_BUILD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "patcher_archive_build_duration_seconds",
            "Time taken to build a chunk archive on scratch storage",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .expect("metric creation failed")
});

pub static CHUNKS_RECLAIMED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "patcher_chunks_reclaimed_total",
            "Total chunk handles removed, by reason (download, expired)",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

pub static SCRATCH_FILES_REMOVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "patcher_scratch_files_removed_total",
        "Total scratch archives deleted by the reclaimer or janitor",
    )
    .expect("metric creation failed")
});

pub static PLANS_RATE_LIMITED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "patcher_plans_rate_limited_total",
        "Total planning requests rejected by the rate limiter",
    )
    .expect("metric creation failed")
});

/// Register all metrics with the global registry. Safe to call more than once.
pub fn register_metrics() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(PLANS_CREATED.clone()),
            Box::new(CHUNKS_REGISTERED.clone()),
            Box::new(REGISTERED_CHUNKS.clone()),
            Box::new(ARCHIVES_SERVED.clone()),
            Box::new(ARCHIVE_FILES_SKIPPED.clone()),
            Box::new(ARCHIVE_BUILD_DURATION.clone()),
            Box::new(CHUNKS_RECLAIMED.clone()),
            Box::new(SCRATCH_FILES_REMOVED.clone()),
            Box::new(PLANS_RATE_LIMITED.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// Record a removed chunk handle.
pub fn record_reclaimed(reason: &str) {
    CHUNKS_RECLAIMED.with_label_values(&[reason]).inc();
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

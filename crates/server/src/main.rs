//! Patch server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use patcher_core::config::AppConfig;
use patcher_server::mirror::SyncOutcome;
use patcher_server::{AppState, GitUpstream, Upstream, create_router};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Patcher - serves a mirrored patch tree as on-demand zip chunks
#[derive(Parser, Debug)]
#[command(name = "patcherd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "PATCHER_CONFIG",
        default_value = "config/patcher.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Patcher v{}", env!("CARGO_PKG_VERSION"));

    // Every setting has a default, so a missing file is not an error.
    let mut figment = Figment::new();
    if std::path::Path::new(&args.config).exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::info!(
            config_path = %args.config,
            "No config file found, using defaults and environment"
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("PATCHER_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    patcher_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let upstream: Arc<dyn Upstream> = Arc::new(GitUpstream::from_config(&config.mirror));

    if config.mirror.sync_on_startup {
        let outcome = upstream
            .sync()
            .await
            .context("initial mirror sync failed")?;
        if outcome == SyncOutcome::Skipped {
            tracing::warn!(
                root = %config.mirror.root.display(),
                "No upstream repository configured, serving the mirror root as-is"
            );
        }
    }

    let state = AppState::new(config.clone(), upstream).context("invalid configuration")?;
    state.spawn_background();

    let app = create_router(state.clone());

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!(
        root = %config.mirror.root.display(),
        scratch_dir = %config.chunks.scratch_dir.display(),
        "Listening on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    state.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

//! Larder server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use larder_core::{AppConfig, CacheUri};
use larder_server::{AppState, create_router};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Larder - a Bazel remote build cache
#[derive(Parser, Debug)]
#[command(name = "larder")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to an optional TOML configuration file
    #[arg(long, env = "LARDER_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8080
    #[arg(short = 'a', long)]
    listen_addr: Option<String>,

    /// Cache URI: file:///path, s3://bucket/prefix or gs://bucket/prefix
    #[arg(short, long, env = "CACHE_URI")]
    cache: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info,tower_http=info")]
    log_level: String,
}

/// Merge defaults, the config file, `LARDER_` env vars and CLI flags.
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(path) = &args.config {
        if !path.exists() {
            anyhow::bail!("config file not found: {}", path.display());
        }
        tracing::info!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    }

    let mut config: AppConfig = figment
        .merge(Env::prefixed("LARDER_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    if let Some(addr) = &args.listen_addr {
        config.server.listen_addr = addr.clone();
    }
    if let Some(uri) = &args.cache {
        config.storage.uri = uri.clone();
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Larder v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;

    larder_server::metrics::register_metrics();

    let cache_uri: CacheUri = config.storage.uri.parse()?;
    let backend = larder_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    tracing::info!(
        backend = backend.backend_name(),
        cache = %cache_uri,
        "Storage backend initialized"
    );

    // Refuse to serve a backend we cannot reach.
    let timeout = config.server.health_check_timeout();
    tokio::time::timeout(timeout, backend.health_check())
        .await
        .with_context(|| format!("storage health check timed out after {timeout:?}"))?
        .context("storage health check failed")?;
    tracing::info!("Storage backend connectivity verified");

    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .context("invalid listen address")?;

    let state = AppState::new(config, backend);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

//! ImageForge — VM image build/test/promote service.
//!
//! Accepts build requests over HTTP, supervises the external image
//! build tool, boots a disposable test VM from each candidate image,
//! and promotes candidates whose in-guest agent reports success.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use imageforge_server::cloud::{CloudProvider, OpenStackClient};
use imageforge_server::config::Config;
use imageforge_server::metrics;
use imageforge_server::routes::{self, AppState};
use imageforge_server::services::builder::Builder;
use imageforge_server::store::BuildStore;

#[derive(Parser)]
#[command(name = "imageforge", about = "VM image build/test/promote service")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "FORGE_PORT", default_value = "8080")]
    port: u16,

    /// SQLite database path
    #[arg(long, env = "FORGE_DB_PATH", default_value = "./imageforge.db")]
    db_path: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();

    tracing::info!("Starting ImageForge server...");
    let config = Arc::new(Config::from_env());

    // Record store; no point starting without it.
    let store = BuildStore::open(Path::new(&cli.db_path)).context("failed to init storage")?;
    store.init().context("failed to create tables")?;
    let store = Arc::new(store);

    // Cloud adapter. With credentials present a failed login is fatal;
    // without them the server still serves status/history endpoints.
    let cloud_client = OpenStackClient::new(&config)?;
    if !config.auth_url.is_empty() {
        cloud_client
            .authenticate()
            .await
            .context("failed to connect to cloud")?;
    }
    let cloud: Arc<dyn CloudProvider> = Arc::new(cloud_client);

    let builder = Arc::new(Builder::new(&config));

    metrics::init_metrics();

    let state = AppState {
        store,
        cloud,
        builder,
        config,
    };
    let app = routes::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("ImageForge listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}

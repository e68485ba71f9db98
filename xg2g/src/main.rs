//! xg2g playback session engine daemon.

use tracing::{error, info};
use xg2g::config::AppConfig;
use xg2g::logging::init_logging;
use xg2g::services::ServiceContainer;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let _guard = init_logging(&log_dir)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    info!("starting xg2g v{}", env!("CARGO_PKG_VERSION"));

    dotenvy::dotenv().ok();
    let config = AppConfig::from_env_or_default()
        .map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;

    info!(database_url = %config.database_url, "connecting to state store");
    let container = ServiceContainer::new(config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to wire services: {e}"))?;

    container
        .initialize()
        .await
        .map_err(|e| anyhow::anyhow!("failed to initialize services: {e}"))?;
    container.start_api_server();

    info!("xg2g started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, initiating shutdown");
        }
        _ = wait_for_sigterm() => {
            info!("received SIGTERM, initiating shutdown");
        }
    }

    container.shutdown().await;
    info!("xg2g shutdown complete");
    Ok(())
}

/// Wait for SIGTERM (Unix only).
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!(error = %e, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // No SIGTERM on Windows; Ctrl+C above covers shutdown.
    std::future::pending::<()>().await;
}

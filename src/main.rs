//! zerocam: MJPEG camera server with runtime resolution changes

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::WrapErr, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use zerocam::capture;
use zerocam::pipeline::{FrameBus, ReconfigCoordinator, SessionPolicy};
use zerocam::server::{self, AppState};
use zerocam::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zerocam=debug,tower_http=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("zerocam v{} launching...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    info!(?config, "Configuration loaded");

    // Initialize capture
    let source = capture::open_source(&config.capture)?;
    let bus = Arc::new(FrameBus::new());
    let coordinator = Arc::new(ReconfigCoordinator::new(
        source,
        bus,
        config.capture.cpu_core,
    ));

    // A camera that fails here can still be started with a resolution change
    if let Err(e) = coordinator.start(config.capture.resolution).await {
        error!("Initial capture start failed: {}", e);
    }

    let addr = config.server.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {addr}"))?;

    let state = AppState::new(coordinator.clone(), SessionPolicy::from(&config.stream));
    let shutdown = {
        let coordinator = coordinator.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Unable to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
            // Closing the bus ends every open stream so the server can drain
            if let Err(e) = coordinator.shutdown().await {
                error!("Capture shutdown failed: {}", e);
            }
        }
    };

    server::serve(listener, state, shutdown).await?;

    info!("zerocam shut down");
    Ok(())
}

//! Snip Router - Main entry point
//!
//! Runs the router as a daemon on a Unix socket. The native messaging host
//! relays extension traffic to it.

use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use snip_router::{Collaborators, Config, Services, SnipServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load();

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.general.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Starting Snip Router");
    info!("Configuration loaded from {:?}", Config::default_config_path());

    if !config.general.enabled {
        info!("Router is disabled in configuration, exiting");
        return Ok(());
    }

    let collaborators = Collaborators::system(&config)?;
    let services = Arc::new(Services::new(&config, collaborators));
    services.pipeline.spawn_drain();
    info!(
        "✅ Pipeline draining every {}ms (queue limit {})",
        config.pipeline.drain_interval_ms, config.pipeline.max_queue_size
    );

    // Setup shutdown signal
    let shutdown = Arc::new(Notify::new());
    let notify = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("🛑 Shutting down...");
        notify.notify_one();
    })?;

    let server = SnipServer::new(config.server.socket_path.clone(), Arc::clone(&services));
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown.notified() => {}
    }

    services.shutdown().await;
    if server.socket_path().exists() {
        std::fs::remove_file(server.socket_path())?;
    }

    info!("👋 Shutdown complete");
    Ok(())
}

//! replwire server entry point.
//!
//! Starts the REPL listener and runs until Ctrl-C.

use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

use replwire::config::{LogFormat, ReplConfig};
use replwire::server::ReplServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = ReplConfig::from_env().context("invalid configuration")?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    tracing::info!(host = %config.host, port = config.port, "starting replwire");

    // Build engine and controller
    let server = ReplServer::new(config).context("cannot create server")?;

    // Start server
    let addr = server
        .start_default()
        .await
        .context("cannot start listener")?;
    tracing::info!(%addr, "server listening");

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    server.stop().await;
    tracing::info!(status = %server.status().await, "bye");

    Ok(())
}

//! Chorus client binary: wires a `tokio-tungstenite` transport and a
//! `cpal` output sink into the core's [`SessionCoordinator`], with a
//! `clap`-parsed CLI, YAML configuration, and signal-based graceful
//! shutdown.

mod config;
mod sink;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chorus_core::events::LoggingEventEmitter;
use chorus_core::{FilterDimension, Renderer, SessionCoordinator, TimeFilter, TokioSpawner};
use clap::Parser;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use crate::config::FileConfig;
use crate::sink::CpalSink;
use crate::transport::TungsteniteConnector;

#[derive(Debug, Parser)]
#[command(name = "chorus-client", about = "Synchronized multi-room audio playback client")]
struct Args {
    /// Path to a YAML configuration file.
    #[arg(long, env = "CHORUS_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the configured server URL.
    #[arg(long, env = "CHORUS_SERVER_URL_ARG")]
    server_url: Option<String>,

    /// `error`, `warn`, `info`, `debug`, or `trace`.
    #[arg(long, env = "CHORUS_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut file_config = FileConfig::load(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        file_config.server_url = server_url;
    }
    let client_config = file_config.to_client_config()?;

    tracing::info!(
        server_url = %client_config.server_url,
        device_name = %client_config.device_name,
        player_id = %client_config.player_id,
        "starting chorus-client"
    );

    let filter = Arc::new(Mutex::new(TimeFilter::new(FilterDimension::Three)));
    let renderer = Arc::new(Renderer::new(filter.clone()));
    let spawner = TokioSpawner::current();

    let sink: Box<dyn chorus_core::OutputSink> = Box::new(CpalSink::default());
    renderer.start(&spawner, sink);

    let coordinator = Arc::new(SessionCoordinator::new(
        client_config,
        Arc::new(TungsteniteConnector),
        filter,
        renderer,
        Arc::new(LoggingEventEmitter),
        spawner,
    ));

    coordinator.connect();

    shutdown_signal().await;
    tracing::info!("shutdown signal received, disconnecting");
    coordinator.disconnect();

    // Give the lifecycle task a moment to send a clean close frame before
    // the process exits out from under it.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    Ok(())
}

/// Waits for either Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

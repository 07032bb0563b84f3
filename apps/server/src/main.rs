//! Overtone Server - standalone headless server for Overtone Bridge.
//!
//! Bridges the media-server companion protocol to a network audio renderer
//! as a background daemon: discovery beacon, companion HTTP surface and
//! subscriber notifications, with playback executed on the configured
//! renderer device.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use crate::config::ServerConfig;

/// Overtone Server - headless companion-protocol bridge.
#[derive(Parser, Debug)]
#[command(name = "overtone-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "OVERTONE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Companion port (overrides config file).
    #[arg(short = 'p', long, env = "OVERTONE_COMPANION_PORT")]
    companion_port: Option<u16>,

    /// Discovery beacon port (overrides config file).
    #[arg(short = 'b', long, env = "OVERTONE_BEACON_PORT")]
    beacon_port: Option<u16>,

    /// Renderer device address, `ip` or `ip:port` (overrides config file).
    #[arg(short = 'd', long, env = "OVERTONE_DEVICE_IP")]
    device_ip: Option<String>,

    /// Name shown in controller device pickers (overrides config file).
    #[arg(short = 't', long)]
    title: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Overtone Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration and apply CLI overrides
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.companion_port {
        config.companion_port = port;
    }
    if let Some(port) = args.beacon_port {
        config.beacon_port = port;
    }
    if let Some(device_ip) = args.device_ip {
        config.device_ip = Some(device_ip);
    }
    if let Some(title) = args.title {
        config.title = Some(title);
    }

    let core_config = config.to_core_config()?;
    log::info!(
        "Configuration: companion_port={}, beacon_port={}, renderer={:?}",
        core_config.companion_port,
        core_config.beacon_port,
        core_config.renderer
    );

    let services =
        overtone_core::bootstrap_services(&core_config).context("Failed to bootstrap services")?;

    // The renderer decides when the bridge is usable; announce nothing
    // before it can actually play.
    log::info!("Waiting for the renderer to become ready");
    services.coordinator.wait_until_ready().await;

    services.start_background_tasks();

    // Serve the companion surface until the cancellation token fires.
    let app_state = services.app_state();
    let companion_port = services.companion_port;
    let server_cancel = services.cancel_token.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = overtone_core::start_server(app_state, companion_port, server_cancel).await
        {
            log::error!("Server error: {}", e);
        }
    });

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    services.shutdown().await;
    let _ = server_handle.await;

    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

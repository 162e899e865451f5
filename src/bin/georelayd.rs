//! georelay daemon - real-time location relay for ride pooling
//!
//! Accepts WebSocket connections from rider and driver-candidate apps,
//! relays positions to nearby peers, and groups co-located
//! driver-candidates.
//!
//! # Usage
//!
//! ```bash
//! # Serve with defaults (0.0.0.0:8080)
//! georelayd
//!
//! # Serve with a config file and an explicit port
//! georelayd --config relay.toml --port 9000 serve
//!
//! # Print the effective configuration
//! georelayd --config relay.toml check-config
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use georelayd::config::RelayConfig;
use georelayd::registry::spawn_registry;
use georelayd::server::RelayServer;

/// georelay daemon - location relay for ride pooling
#[derive(Parser, Debug)]
#[command(name = "georelayd", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "GEORELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind (overrides config and environment)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides config and environment)
    #[arg(short, long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay (default)
    Serve,
    /// Validate the configuration and print it as TOML
    CheckConfig,
}

fn load_config(args: &Args) -> Result<RelayConfig> {
    let mut config = RelayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_relay(config),
        Command::CheckConfig => {
            let rendered = config.to_toml().context("Failed to render configuration")?;
            print!("{rendered}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn run_relay(config: RelayConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("georelayd=info".parse()?)
                .add_directive("georelay_core=info".parse()?)
                .add_directive("georelay_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "georelay daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let registry = spawn_registry(&config);
    info!(
        max_clients = config.max_clients,
        max_groups = config.max_groups,
        broadcast_radius_m = config.broadcast_radius_m,
        proximity_threshold_m = config.proximity_threshold_m,
        "Registry started"
    );

    let server = RelayServer::new(&config, registry, cancel_token);

    info!(addr = %config.bind_addr(), "Starting server");

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("georelay daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

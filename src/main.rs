//! notify-relay - main entry point

use notify_relay::config::{RelayConfig, DEFAULT_CONFIG_PATHS};
use notify_relay::error::RelayResult;
use notify_relay::observability::init_default_logging;
use notify_relay::service::RelayService;
use notify_relay::transport::mqtt::{probe_connection, ConnectOptions, RumqttcConnector};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

/// Resilient MQTT connectivity and command routing daemon
#[derive(Parser)]
#[command(name = "notify-relay")]
#[command(about = "Resilient MQTT connectivity and command routing daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker and route commands until SIGINT/SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Test the broker connection once and exit
    Probe {
        /// Seconds to wait for the handshake
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting notify-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_relay(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Probe { timeout } => run_probe(&config, Duration::from_secs(timeout)).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e.sanitized());
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> RelayResult<RelayConfig> {
    let config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            RelayConfig::load_from_file(path)?
        }
        None => {
            info!(
                "No configuration path given, searching {}",
                DEFAULT_CONFIG_PATHS.join(", ")
            );
            RelayConfig::load_default()?
        }
    };
    config.validate()?;
    Ok(config)
}

async fn run_relay(config: RelayConfig) -> RelayResult<()> {
    info!("Relay starting with id: {}", config.relay.id);

    let service = RelayService::new(config, Arc::new(RumqttcConnector::new()))?;
    service.start().await?;

    if let Some(addr) = service.endpoint_addr() {
        info!("HTTP endpoint available on {}", addr);
    }

    wait_for_shutdown_signal().await;

    info!("Application shutdown initiated");
    service.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let (mut sigint, mut sigterm) = match (
        signal::unix::signal(signal::unix::SignalKind::interrupt()),
        signal::unix::signal(signal::unix::SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        _ => {
            error!("Failed to install signal handlers, falling back to Ctrl-C");
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("Received Ctrl-C, shutting down gracefully...");
}

fn handle_config_command(config: &RelayConfig, show: bool) -> RelayResult<()> {
    info!("Configuration is valid");

    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| notify_relay::error::RelayError::internal(e.to_string()))?;
        println!("{rendered}");
    }

    Ok(())
}

async fn run_probe(config: &RelayConfig, timeout: Duration) -> RelayResult<()> {
    let options = ConnectOptions::from_config(config)?;
    info!(
        "Probing broker {}:{} (timeout {}s)",
        options.host,
        options.port,
        timeout.as_secs()
    );

    let outcome = probe_connection(&RumqttcConnector::new(), &options, timeout).await;
    println!("{}", outcome.message);

    if outcome.success {
        Ok(())
    } else {
        Err(notify_relay::error::RelayError::Transport(
            notify_relay::transport::mqtt::MqttError::ConnectionFailed(outcome.message),
        ))
    }
}

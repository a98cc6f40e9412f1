//! gateway-cloud - connects the gateway to its MQTT broker and keeps it there

use clap::{Parser, Subcommand};
use gateway_cloud::config::GatewayConfig;
use gateway_cloud::gateway::Gateway;
use gateway_cloud::observability::init_default_logging;
use gateway_cloud::transport::NoopDecryptor;
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tracing::{error, info};

/// IoT gateway cloud connectivity
#[derive(Parser)]
#[command(name = "gateway-cloud")]
#[command(about = "Cloud connectivity for IoT gateways over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker and run until interrupted
    Run,
    /// Validate the configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting gateway-cloud v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_gateway(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => ["gateway.toml", "config/gateway.toml"]
            .into_iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            .ok_or("no configuration file found; pass -c/--config or create gateway.toml")?,
    };

    info!("Loading configuration from: {}", path.display());
    Ok(GatewayConfig::load_from_file_with(&path, &NoopDecryptor)?)
}

async fn run_gateway(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        broker_url = %config.transport.broker_url,
        account_name = %config.transport.account_name,
        "Gateway starting"
    );

    let gateway = Gateway::with_rumqttc(config);
    gateway.start();

    wait_for_shutdown_signal().await?;

    info!("Shutdown initiated");
    gateway.stop().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down gracefully...");
    Ok(())
}

fn handle_config_command(
    config: &GatewayConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        let mut printable = config.clone();
        if printable.transport.password.is_some() {
            printable.transport.password = Some("***".to_string());
        }
        println!("{}", toml::to_string_pretty(&printable)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

//! Camera node daemon

use anyhow::{Context, Result};
use camnode::config::Config;
use camnode::supervisor::{Capabilities, Supervisor};
use clap::Parser;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "camnode")]
#[command(about = "Camera node: broker commands, frame upload and RTSP-style streaming")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "camnode.toml")]
    config: String,

    /// Override the device id used in collector paths
    #[arg(long)]
    device_id: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if Path::new(&cli.config).exists() {
        Config::load(&cli.config).with_context(|| format!("loading {}", cli.config))?
    } else {
        warn!(config_path = %cli.config, "Configuration file not found, using defaults");
        Config::default()
    };

    if let Some(device_id) = &cli.device_id {
        config.collector.device_id = device_id.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    info!(version = env!("CARGO_PKG_VERSION"), "Camera node starting");
    info!(config_path = %cli.config, "Loading configuration");

    let config = load_config(&cli)?;
    info!(
        ssid = %config.network.ssid,
        broker = %config.broker.endpoint(),
        collector = %config.collector.endpoint(),
        device_id = %config.collector.device_id,
        streaming = config.streaming.enabled,
        "Configuration loaded"
    );

    let supervisor = Supervisor::start(&config, Capabilities::from_config(&config))
        .context("startup failed")?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    supervisor.shutdown().await;

    info!("Camera node stopped");
    Ok(())
}

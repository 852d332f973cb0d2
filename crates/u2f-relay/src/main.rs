//! u2f-relay: runs the relay behind a WebSocket bridge.
//!
//! Each WebSocket connection plays the hosting frame for one relay; devices
//! are in-process virtual keys configured in the `[device]` section.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use u2f_relay::config::{ConfigOverrides, RelayConfig};
use u2f_relay::{bridge, device};

/// u2f-relay: message relay between a hosting page and a U2F key transport
#[derive(Parser, Debug)]
#[command(name = "u2f-relay", version, about = "U2F message relay")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.u2f-relay/config.toml")]
    config: String,

    /// Bridge bind address
    #[arg(long)]
    bind: Option<String>,

    /// Bridge listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Allowed page origin (repeatable, `*` for any)
    #[arg(long = "allowed-origin")]
    allowed_origins: Vec<String>,

    /// Virtual device path (repeatable)
    #[arg(long = "virtual-device")]
    virtual_devices: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting u2f-relay");

    let config_path = PathBuf::from(&cli.config);
    let config = RelayConfig::load(
        Some(&config_path),
        ConfigOverrides {
            bind: cli.bind,
            port: cli.port,
            allowed_origins: cli.allowed_origins,
            virtual_devices: cli.virtual_devices,
        },
    )?;

    if config.allowed_origins.iter().any(|o| o == "*") {
        warn!("accepting handshakes from any origin");
    }

    let transport = Arc::new(device::virtual_transport(
        config.supported,
        &config.virtual_devices,
    ));
    info!(
        devices = ?config.virtual_devices,
        supported = config.supported,
        "virtual transport ready"
    );

    let listener = bridge::bind(&config.bind_addr()).await?;

    tokio::select! {
        result = bridge::serve(listener, transport, config.relay_options()) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}

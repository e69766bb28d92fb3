//! Joy-Con 2 Mouse - Main Application
//!
//! Runs the driver with the btleplug BLE stack and uinput virtual devices.
//! The Bluetooth daemon must already accept unbonded LE connections.
//!
//! Usage: joy2-mouse [config.toml]   (defaults to configs/default.toml)

use anyhow::{Context, Result};
use joy2_mouse::mapping::config::Config;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path).with_context(|| format!("loading config from {}", path))?,
        None => Config::load_default().context("loading configs/default.toml")?,
    };

    run(config).await
}

#[cfg(target_os = "linux")]
async fn run(config: Config) -> Result<()> {
    use joy2_mouse::backend::UinputBackend;
    use joy2_mouse::{BtleplugTransport, JoyConManager};
    use log::warn;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    let transport = BtleplugTransport::new().await.context("opening Bluetooth adapter")?;
    let manager = JoyConManager::new(config, Arc::new(transport), UinputBackend::new());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, shutting down...");
                signal.cancel();
            }
            Err(e) => warn!("Unable to listen for Ctrl+C: {}", e),
        }
    });

    info!("Press Ctrl+C to stop");
    manager.run(shutdown).await.context("driver stopped with an error")?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_config: Config) -> Result<()> {
    Err(joy2_mouse::backend::BackendError::PlatformNotSupported).context("virtual input devices need Linux uinput")
}

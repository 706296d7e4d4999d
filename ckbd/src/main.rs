//! ckbd - Main Entry Point
//!
//! Loads the configuration, creates the root node, attaches every supported device and keeps
//! rescanning for hot-plugged ones until SIGINT or SIGTERM.

use ckbd::config::{ConfigManager, DEFAULT_CONFIG_PATH};
use ckbd::device::DeviceManager;
use ckbd::injector::{Injector, NullInjector, UinputInjector};
use ckbd::security::{self, NodePermissions};
use ckbd::transport::HidapiOpener;
use ckbd::Registry;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let mut config_manager = ConfigManager::new(&config_path);
    let load_result = config_manager.load_config().await;
    let config = config_manager.config().clone();

    let level: Level = config.daemon.log_level.parse().unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    info!("Starting ckbd v{}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = load_result {
        error!("Failed to load {}: {}", config_path, e);
        return Err(e.into());
    }
    if !security::is_root() {
        warn!("ckbd is not running as root; device and uinput access may fail");
    }

    let perms = NodePermissions::new(config.daemon.node_group);
    let registry = Registry::create(config, perms)?;

    let injector: Arc<dyn Injector> = match UinputInjector::new("ckb virtual input") {
        Ok(injector) => {
            info!("Uinput injector initialized");
            Arc::new(injector)
        }
        Err(e) => {
            warn!("uinput unavailable ({}); key events will not be injected", e);
            Arc::new(NullInjector)
        }
    };
    let opener = match HidapiOpener::new() {
        Ok(opener) => Arc::new(opener),
        Err(e) => {
            error!("Failed to initialize hidapi: {}", e);
            registry.teardown();
            return Err(e.into());
        }
    };

    let manager = Arc::new(DeviceManager::new(Arc::clone(&registry), opener, injector));
    let attached = manager.rescan();
    info!("{} device(s) attached at start-up", attached);

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut rescan = tokio::time::interval(Duration::from_millis(
        registry.config.device_discovery.rescan_interval_ms,
    ));

    loop {
        tokio::select! {
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
                break;
            }
            _ = interrupt.recv() => {
                info!("Received SIGINT, shutting down gracefully");
                break;
            }
            _ = rescan.tick() => {
                let manager = Arc::clone(&manager);
                match tokio::task::spawn_blocking(move || manager.rescan()).await {
                    Ok(0) => {}
                    Ok(n) => info!("{} device(s) attached", n),
                    Err(e) => error!("Device rescan failed: {}", e),
                }
            }
        }
    }

    info!("Starting cleanup...");
    let shutdown = Arc::clone(&manager);
    if let Err(e) = tokio::task::spawn_blocking(move || shutdown.shutdown()).await {
        error!("Error during device shutdown: {}", e);
    }
    registry.teardown();
    info!("ckbd shutdown complete");
    Ok(())
}

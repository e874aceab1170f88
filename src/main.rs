//! OpenSASE Forwarder - Main Entry Point
//!
//! The tunnel device is created by the platform (VPN service, `ip tuntap`)
//! and handed over as an open file descriptor in `SASE_TUN_FD`.

use std::sync::Arc;

use sase_forwarder::attribution::OwnerTable;
use sase_forwarder::forwarder::protect;
#[cfg(unix)]
use sase_forwarder::tun;
use sase_forwarder::{Engine, EngineConfig, EngineError};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config
    let config_path =
        std::env::var("SASE_FORWARDER_CONFIG").unwrap_or_else(|_| "/etc/opensase/forwarder.json".into());
    let loaded = EngineConfig::load(&config_path);
    let config = loaded.as_ref().cloned().unwrap_or_default();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("OpenSASE Forwarder v{}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = loaded {
        tracing::warn!("Config not loaded from {} ({}), using defaults", config_path, e);
    }

    // Refuse to forward through sockets the tunnel would capture again
    let protector = protect::from_config(&config.protect)?;
    tracing::info!("Socket protection: {}", protector.name());

    let (reader, writer) = open_tun()?;
    let engine = Arc::new(Engine::new(config, writer, protector, owner_table())?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    engine.run(reader, shutdown_rx).await?;
    tracing::info!("Final stats: {}", serde_json::to_string(&engine.stats())?);
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn owner_table() -> Arc<dyn OwnerTable> {
    Arc::new(sase_forwarder::attribution::ProcNetOwnerTable::new())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn owner_table() -> Arc<dyn OwnerTable> {
    Arc::new(sase_forwarder::attribution::EmptyOwnerTable)
}

#[cfg(unix)]
fn open_tun() -> Result<(tun::DeviceReader, tun::DeviceWriter), EngineError> {
    use std::os::fd::{FromRawFd, OwnedFd, RawFd};

    let fd: RawFd = std::env::var("SASE_TUN_FD")
        .map_err(|_| EngineError::Config("SASE_TUN_FD is not set".into()))?
        .parse()
        .map_err(|e| EngineError::Config(format!("SASE_TUN_FD: {}", e)))?;
    if fd < 0 {
        return Err(EngineError::Config(format!("SASE_TUN_FD: invalid descriptor {}", fd)));
    }

    // SAFETY: the descriptor is handed to this process for its exclusive use
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(tun::TunDevice::new(fd)?.split())
}

#[cfg(not(unix))]
fn open_tun() -> Result<(tokio::io::Empty, tokio::io::Sink), EngineError> {
    Err(EngineError::Config("tunnel descriptors are only supported on unix".into()))
}

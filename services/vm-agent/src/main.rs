//! ember VM agent
//!
//! Manages Firecracker microVMs on this host.
//!
//! ## Architecture
//!
//! - **Recovery**: rebuilds runtime state from the SQLite store at startup
//! - **Reclaim loop**: releases addresses of long-stopped VMs (when enabled)
//! - **Shutdown**: stops every running VM on Ctrl-C or SIGTERM

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ember_vm_agent::config::{Config, NetworkDriverKind};
use ember_vm_agent::firecracker::ProcessSupervisor;
use ember_vm_agent::{
    AddressRetention, IpTapDriver, MockTapDriver, ResourceAllocator, SqliteStateStore, TapDriver,
    VmManager,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Upper bound on how often idle addresses are checked.
const MAX_RECLAIM_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting ember VM agent");
    info!(
        socket_dir = %config.socket_dir.display(),
        database = %config.database_path.display(),
        subnet = %config.subnet,
        network_driver = ?config.network_driver,
        "Configuration loaded"
    );

    let store = SqliteStateStore::open(&config.database_path).with_context(|| {
        format!("failed to open state store {}", config.database_path.display())
    })?;

    let taps: Arc<dyn TapDriver> = match config.network_driver {
        NetworkDriverKind::Ip => Arc::new(IpTapDriver::new()),
        NetworkDriverKind::Mock => {
            warn!("Using mock network driver, no TAP devices will be created");
            Arc::new(MockTapDriver::new())
        }
    };

    let manager = VmManager::new(
        config.manager_config(),
        ResourceAllocator::new(config.pool_config()),
        ProcessSupervisor::new(config.supervisor_config()),
        taps,
        Arc::new(store),
    );

    manager.recover().await.context("failed to recover VM state")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reclaim_handle = match config.address_retention {
        AddressRetention::IdleFor(idle) => Some(tokio::spawn(run_reclaim_loop(
            Arc::clone(&manager),
            idle.clamp(Duration::from_secs(1), MAX_RECLAIM_INTERVAL),
            shutdown_rx,
        ))),
        AddressRetention::Indefinite => None,
    };

    // Wait for shutdown signal
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = reclaim_handle {
        let _ = handle.await;
    }

    let report = manager.shutdown(config.shutdown_timeout).await;
    info!(
        stopped = report.stopped,
        failed = report.failed,
        timed_out = report.timed_out,
        "VM agent shutdown complete"
    );
    Ok(())
}

async fn run_reclaim_loop(
    manager: Arc<VmManager>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reclaimed = manager.reclaim_idle_addresses().await;
                if reclaimed > 0 {
                    info!(reclaimed, "Reclaimed addresses of idle VMs");
                }
            }
            _ = shutdown_rx.changed() => {
                info!("Reclaim loop shutting down");
                break;
            }
        }
    }
}

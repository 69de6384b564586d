//! TAP device creation and removal.
//!
//! Each VM gets a dedicated TAP device that Firecracker uses for its
//! virtio-net interface (eth0 inside the guest). Device names come from the
//! allocator's TAP pool, so they are unique and fit `IFNAMSIZ`.
//!
//! Host-side setup:
//! - `ip tuntap add dev {name} mode tap`
//! - `ip link set dev {name} up`
//! - optionally `ip link set dev {name} master {bridge}`

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use ember_networking::TapName;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Errors from TAP device operations.
#[derive(Debug, Error)]
pub enum TapError {
    #[error("failed to create TAP device: {0}")]
    CreateFailed(String),

    #[error("failed to configure TAP device: {0}")]
    ConfigFailed(String),

    #[error("failed to delete TAP device: {0}")]
    DeleteFailed(String),

    #[error("command execution failed: {0}")]
    CommandFailed(#[from] std::io::Error),
}

/// Host network device operations needed by the lifecycle manager.
#[async_trait]
pub trait TapDriver: Send + Sync {
    /// Create a TAP device, bring it up and optionally attach it to a bridge.
    async fn create(&self, name: &TapName, bridge: Option<&str>) -> Result<(), TapError>;

    /// Delete a TAP device. Deleting a missing device succeeds.
    async fn delete(&self, name: &TapName) -> Result<(), TapError>;
}

/// Driver that shells out to iproute2.
#[derive(Debug, Default, Clone)]
pub struct IpTapDriver;

impl IpTapDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TapDriver for IpTapDriver {
    async fn create(&self, name: &TapName, bridge: Option<&str>) -> Result<(), TapError> {
        let tap = name.as_str();
        info!(tap = %tap, bridge = ?bridge, "Creating TAP device");

        run_ip(&["tuntap", "add", "dev", tap, "mode", "tap"])
            .await
            .map_err(TapError::CreateFailed)?;

        if let Err(e) = run_ip(&["link", "set", "dev", tap, "up"]).await {
            let _ = run_ip(&["link", "delete", tap]).await;
            return Err(TapError::ConfigFailed(format!("bring up: {e}")));
        }

        if let Some(bridge) = bridge {
            if let Err(e) = run_ip(&["link", "set", "dev", tap, "master", bridge]).await {
                let _ = run_ip(&["link", "delete", tap]).await;
                return Err(TapError::ConfigFailed(format!("attach to {bridge}: {e}")));
            }
        }

        debug!(tap = %tap, "TAP device created");
        Ok(())
    }

    async fn delete(&self, name: &TapName) -> Result<(), TapError> {
        let tap = name.as_str();
        info!(tap = %tap, "Deleting TAP device");

        match run_ip(&["link", "delete", tap]).await {
            Ok(()) => Ok(()),
            Err(e) if e.contains("Cannot find device") => {
                debug!(tap = %tap, "TAP device already gone");
                Ok(())
            }
            Err(e) => Err(TapError::DeleteFailed(e)),
        }
    }
}

/// Run an `ip` command. The error carries the command line and stderr.
async fn run_ip(args: &[&str]) -> Result<(), String> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| format!("failed to execute ip: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("ip {} failed: {}", args.join(" "), stderr.trim()));
    }

    Ok(())
}

/// A call observed by [`MockTapDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapCall {
    Create { name: String, bridge: Option<String> },
    Delete { name: String },
}

/// In-memory driver for development hosts and tests.
#[derive(Debug, Default)]
pub struct MockTapDriver {
    calls: Mutex<Vec<TapCall>>,
    devices: Mutex<BTreeSet<String>>,
    fail_creates: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MockTapDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create` calls fail.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `delete` calls fail.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<TapCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Devices that currently exist.
    pub fn devices(&self) -> Vec<String> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Whether a device currently exists.
    pub fn exists(&self, name: &str) -> bool {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    fn record(&self, call: TapCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

#[async_trait]
impl TapDriver for MockTapDriver {
    async fn create(&self, name: &TapName, bridge: Option<&str>) -> Result<(), TapError> {
        self.record(TapCall::Create {
            name: name.to_string(),
            bridge: bridge.map(str::to_string),
        });

        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(TapError::CreateFailed(format!(
                "mock driver refused to create {name}"
            )));
        }

        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if !devices.insert(name.to_string()) {
            return Err(TapError::CreateFailed(format!("{name} already exists")));
        }
        debug!(tap = %name, "[MOCK] TAP device created");
        Ok(())
    }

    async fn delete(&self, name: &TapName) -> Result<(), TapError> {
        self.record(TapCall::Delete {
            name: name.to_string(),
        });

        if self.fail_deletes.load(Ordering::SeqCst) {
            warn!(tap = %name, "[MOCK] Refusing to delete TAP device");
            return Err(TapError::DeleteFailed(format!(
                "mock driver refused to delete {name}"
            )));
        }

        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name.as_str());
        debug!(tap = %name, "[MOCK] TAP device deleted");
        Ok(())
    }
}

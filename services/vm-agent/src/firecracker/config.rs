//! Firecracker configuration file.
//!
//! These structures map to the document accepted by `firecracker
//! --config-file`. Only the keys the agent needs are emitted; optional
//! Firecracker fields (rate limiters, cache type, SMT) are left at their
//! hypervisor defaults.
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/docs/getting-started.md

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ember_networking::{MacAddr, TapName};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::VmSpec;

/// Upper bound on vCPUs accepted by Firecracker.
pub const MAX_VCPUS: u8 = 32;

/// Kernel command line used for every guest.
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Drive id of the root filesystem.
pub const ROOT_DRIVE_ID: &str = "rootfs";

/// Interface id of the single guest NIC.
pub const GUEST_IFACE_ID: &str = "eth0";

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
}

/// Machine configuration for the microVM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of vCPUs (1-32).
    pub vcpu_count: u8,
    /// Memory size in MiB.
    pub mem_size_mib: u32,
}

/// Boot source configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    /// Path to the kernel image.
    pub kernel_image_path: PathBuf,
    /// Kernel boot arguments.
    pub boot_args: String,
}

/// Block device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveConfig {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

impl DriveConfig {
    /// Writable root disk.
    pub fn root_disk(path: PathBuf) -> Self {
        Self {
            drive_id: ROOT_DRIVE_ID.to_string(),
            path_on_host: path,
            is_root_device: true,
            is_read_only: false,
        }
    }
}

/// Network interface configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    /// Host TAP device backing the interface.
    pub host_dev_name: String,
}

/// Full hypervisor configuration for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypervisorConfig {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    pub drives: Vec<DriveConfig>,
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
}

/// Build the configuration for a VM.
///
/// Pure and deterministic: the same inputs always produce the same value.
/// `spec` must already have its defaults applied.
pub fn build(
    spec: &VmSpec,
    mac: &MacAddr,
    tap: &TapName,
    kernel_path: &Path,
    rootfs_path: &Path,
) -> Result<HypervisorConfig, ConfigError> {
    let vcpu_count = spec.vcpu_count.unwrap_or(0);
    if vcpu_count == 0 || vcpu_count > MAX_VCPUS {
        return Err(ConfigError::InvalidSpec(format!(
            "vcpu_count must be between 1 and {MAX_VCPUS}, got {vcpu_count}"
        )));
    }

    let mem_size_mib = spec.memory_mib.unwrap_or(0);
    if mem_size_mib == 0 {
        return Err(ConfigError::InvalidSpec(
            "memory_mib must be greater than zero".to_string(),
        ));
    }

    if kernel_path.as_os_str().is_empty() {
        return Err(ConfigError::InvalidSpec("kernel path is empty".to_string()));
    }
    if rootfs_path.as_os_str().is_empty() {
        return Err(ConfigError::InvalidSpec("rootfs path is empty".to_string()));
    }

    Ok(HypervisorConfig {
        boot_source: BootSource {
            kernel_image_path: kernel_path.to_path_buf(),
            boot_args: DEFAULT_BOOT_ARGS.to_string(),
        },
        drives: vec![DriveConfig::root_disk(rootfs_path.to_path_buf())],
        machine_config: MachineConfig {
            vcpu_count,
            mem_size_mib,
        },
        network_interfaces: vec![NetworkInterface {
            iface_id: GUEST_IFACE_ID.to_string(),
            guest_mac: mac.to_string(),
            host_dev_name: tap.to_string(),
        }],
    })
}

impl HypervisorConfig {
    /// Append the kernel `ip=` argument so the guest configures its
    /// interface statically at boot.
    pub fn with_guest_network(mut self, ip: Ipv4Addr, gateway: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        self.boot_source.boot_args = format!(
            "{} ip={ip}::{gateway}:{netmask}::{GUEST_IFACE_ID}:off",
            self.boot_source.boot_args
        );
        self
    }

    /// Serialize to the `--config-file` JSON document.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a previously rendered document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// MAC address of the guest interface, if it parses.
    pub fn guest_mac(&self) -> Option<MacAddr> {
        self.network_interfaces
            .first()
            .and_then(|iface| iface.guest_mac.parse().ok())
    }

    /// TAP device the guest interface is attached to.
    pub fn host_dev_name(&self) -> Option<TapName> {
        self.network_interfaces
            .first()
            .and_then(|iface| TapName::new(iface.host_dev_name.clone()).ok())
    }
}

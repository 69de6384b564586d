//! Configuration for the VM agent.
//!
//! Everything is read from `EMBER_*` environment variables. Pool ranges are
//! validated here so that a bad prefix or an oversized TAP pool stops the
//! agent at startup rather than on the first create.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ember_networking::{Ipv4Subnet, MacRange, TapRange};

use crate::allocator::PoolConfig;
use crate::firecracker::SupervisorConfig;
use crate::lifecycle::{AddressRetention, ManagerConfig, SpecDefaults};

/// How long to wait for a process to die after SIGKILL.
const KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// Which TAP driver to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkDriverKind {
    /// Real devices via iproute2.
    Ip,
    /// No host devices; for development hosts without `CAP_NET_ADMIN`.
    Mock,
}

impl FromStr for NetworkDriverKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ip" => Ok(Self::Ip),
            "mock" => Ok(Self::Mock),
            other => bail!("unknown network driver {other:?} (expected \"ip\" or \"mock\")"),
        }
    }
}

/// VM agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the firecracker binary.
    pub firecracker_binary: PathBuf,

    /// Guest kernel image.
    pub kernel_path: PathBuf,

    /// Guest root filesystem image.
    pub rootfs_path: PathBuf,

    /// Directory for control sockets, config files and logs.
    pub socket_dir: PathBuf,

    /// SQLite database file.
    pub database_path: PathBuf,

    /// Guest address range.
    pub subnet: Ipv4Subnet,

    /// Guest MAC range.
    pub mac_range: MacRange,

    /// TAP device names.
    pub tap_range: TapRange,

    /// Host bridge each TAP device is attached to.
    pub bridge_name: Option<String>,

    pub network_driver: NetworkDriverKind,

    /// Sizes used when a create request leaves them out.
    pub defaults: SpecDefaults,

    /// Time between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,

    /// A hypervisor that exits within this window failed to start.
    pub spawn_probe: Duration,

    /// Wait for the control socket after spawn; `None` disables the wait.
    pub socket_wait: Option<Duration>,

    /// Per-VM bound on stopping during agent shutdown.
    pub shutdown_timeout: Duration,

    pub address_retention: AddressRetention,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let path = |key: &str, default: &str| PathBuf::from(string(key, default));

        let subnet_str = string("EMBER_SUBNET", "192.168.100.0/24");
        let subnet = Ipv4Subnet::from_cidr(&subnet_str)
            .with_context(|| format!("EMBER_SUBNET: invalid subnet {subnet_str:?}"))?;

        let mac_prefix_str = string("EMBER_MAC_PREFIX", "02:fc:00");
        let mac_prefix = MacRange::parse_prefix(&mac_prefix_str)
            .with_context(|| format!("EMBER_MAC_PREFIX: invalid prefix {mac_prefix_str:?}"))?;
        let mac_pool_size = parse_var(&lookup, "EMBER_MAC_POOL_SIZE", 4096usize)?;
        let mac_range = MacRange::new(mac_prefix, mac_pool_size)
            .context("EMBER_MAC_PREFIX/EMBER_MAC_POOL_SIZE: invalid MAC range")?;

        let tap_prefix = string("EMBER_TAP_PREFIX", "fc-tap");
        let tap_pool_size = parse_var(&lookup, "EMBER_TAP_POOL_SIZE", 256usize)?;
        let tap_range = TapRange::new(&tap_prefix, tap_pool_size)
            .context("EMBER_TAP_PREFIX/EMBER_TAP_POOL_SIZE: TAP names would be invalid")?;

        let bridge_name = lookup("EMBER_BRIDGE_NAME").filter(|name| !name.is_empty());

        let network_driver = string("EMBER_NETWORK_DRIVER", "ip")
            .parse()
            .context("EMBER_NETWORK_DRIVER")?;

        let defaults = SpecDefaults {
            memory_mib: parse_var(&lookup, "EMBER_DEFAULT_MEMORY_MIB", 512)?,
            vcpu_count: parse_var(&lookup, "EMBER_DEFAULT_VCPUS", 1)?,
            disk_size_gib: parse_var(&lookup, "EMBER_DEFAULT_DISK_GIB", 2)?,
        };

        let socket_wait_ms = parse_var(&lookup, "EMBER_SOCKET_WAIT_MS", 5000u64)?;
        let address_retention = match lookup("EMBER_ADDRESS_RETENTION_SECS") {
            Some(secs) => AddressRetention::IdleFor(Duration::from_secs(
                secs.parse()
                    .with_context(|| format!("EMBER_ADDRESS_RETENTION_SECS: invalid value {secs:?}"))?,
            )),
            None => AddressRetention::Indefinite,
        };

        Ok(Self {
            firecracker_binary: path("EMBER_FIRECRACKER_BINARY", "/usr/bin/firecracker"),
            kernel_path: path("EMBER_KERNEL_PATH", "./vm-images/vmlinux.bin"),
            rootfs_path: path("EMBER_ROOTFS_PATH", "./vm-images/rootfs.ext4"),
            socket_dir: path("EMBER_SOCKET_DIR", "/tmp/firecracker"),
            database_path: path("EMBER_DATABASE_PATH", "./orchestrator.db"),
            subnet,
            mac_range,
            tap_range,
            bridge_name,
            network_driver,
            defaults,
            stop_grace: Duration::from_millis(parse_var(&lookup, "EMBER_STOP_GRACE_MS", 5000)?),
            spawn_probe: Duration::from_millis(parse_var(&lookup, "EMBER_SPAWN_PROBE_MS", 250)?),
            socket_wait: (socket_wait_ms > 0).then(|| Duration::from_millis(socket_wait_ms)),
            shutdown_timeout: Duration::from_millis(parse_var(
                &lookup,
                "EMBER_SHUTDOWN_TIMEOUT_MS",
                10_000,
            )?),
            address_retention,
            log_level: string("EMBER_LOG_LEVEL", "info"),
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            subnet: self.subnet,
            macs: self.mac_range,
            taps: self.tap_range.clone(),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            binary: self.firecracker_binary.clone(),
            spawn_probe: self.spawn_probe,
            socket_timeout: self.socket_wait,
            kill_timeout: KILL_TIMEOUT,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            socket_dir: self.socket_dir.clone(),
            kernel_path: self.kernel_path.clone(),
            rootfs_path: self.rootfs_path.clone(),
            bridge_name: self.bridge_name.clone(),
            defaults: self.defaults,
            stop_grace: self.stop_grace,
            address_retention: self.address_retention,
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key}: invalid value {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.firecracker_binary, PathBuf::from("/usr/bin/firecracker"));
        assert_eq!(config.kernel_path, PathBuf::from("./vm-images/vmlinux.bin"));
        assert_eq!(config.rootfs_path, PathBuf::from("./vm-images/rootfs.ext4"));
        assert_eq!(config.socket_dir, PathBuf::from("/tmp/firecracker"));
        assert_eq!(config.database_path, PathBuf::from("./orchestrator.db"));
        assert_eq!(config.subnet.network(), Ipv4Addr::new(192, 168, 100, 0));
        assert_eq!(config.subnet.prefix_len(), 24);
        assert_eq!(config.network_driver, NetworkDriverKind::Ip);
        assert_eq!(config.bridge_name, None);
        assert_eq!(config.defaults.memory_mib, 512);
        assert_eq!(config.defaults.vcpu_count, 1);
        assert_eq!(config.defaults.disk_size_gib, 2);
        assert_eq!(config.stop_grace, Duration::from_secs(5));
        assert_eq!(config.socket_wait, Some(Duration::from_secs(5)));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.address_retention, AddressRetention::Indefinite);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("EMBER_SUBNET", "10.20.0.0/16"),
            ("EMBER_TAP_PREFIX", "vmtap"),
            ("EMBER_TAP_POOL_SIZE", "1000"),
            ("EMBER_BRIDGE_NAME", "br0"),
            ("EMBER_NETWORK_DRIVER", "mock"),
            ("EMBER_SOCKET_WAIT_MS", "0"),
            ("EMBER_ADDRESS_RETENTION_SECS", "3600"),
            ("EMBER_DEFAULT_VCPUS", "4"),
        ])
        .unwrap();

        assert_eq!(config.subnet.prefix_len(), 16);
        assert_eq!(config.bridge_name.as_deref(), Some("br0"));
        assert_eq!(config.network_driver, NetworkDriverKind::Mock);
        assert_eq!(config.socket_wait, None);
        assert_eq!(
            config.address_retention,
            AddressRetention::IdleFor(Duration::from_secs(3600))
        );
        assert_eq!(config.defaults.vcpu_count, 4);
        assert_eq!(config.supervisor_config().socket_timeout, None);
        assert_eq!(config.manager_config().bridge_name.as_deref(), Some("br0"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(load(&[("EMBER_SUBNET", "not-a-subnet")]).is_err());
        assert!(load(&[("EMBER_SUBNET", "10.0.0.0/8")]).is_err());
        assert!(load(&[("EMBER_MAC_PREFIX", "03:00:00")]).is_err());
        assert!(load(&[("EMBER_TAP_PREFIX", "a-very-long-tap")]).is_err());
        assert!(load(&[("EMBER_STOP_GRACE_MS", "soon")]).is_err());
        assert!(load(&[("EMBER_NETWORK_DRIVER", "netlink")]).is_err());
        assert!(load(&[("EMBER_DEFAULT_VCPUS", "300")]).is_err());
    }
}

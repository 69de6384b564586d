//! Resource allocator for per-VM network identity.
//!
//! Every VM holds one TAP device name, one MAC address and one guest IPv4
//! address. The three pools live behind a single lock so that allocation is
//! atomic across all of them: either a VM gets a full lease or nothing is
//! taken.
//!
//! Ownership is tracked per value, so a value held by one VM can never be
//! handed to another until it is released.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ember_id::VmId;
use ember_networking::{
    Ipv4Pool, Ipv4Subnet, MacAddr, MacPool, MacRange, NetworkError, TapName, TapPool, TapRange,
};
use thiserror::Error;
use tracing::debug;

/// Which pool an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Tap,
    Mac,
    Ip,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolKind::Tap => "TAP device",
            PoolKind::Mac => "MAC address",
            PoolKind::Ip => "IP address",
        })
    }
}

/// Errors from the allocator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("no free {0} left")]
    Exhausted(PoolKind),

    #[error("{value} is held by {owner}")]
    Conflict { value: String, owner: VmId },

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Ranges the pools are built from.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub subnet: Ipv4Subnet,
    pub macs: MacRange,
    pub taps: TapRange,
}

/// Full network identity of one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkLease {
    pub tap: TapName,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
}

/// Number of in-use values per pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolUsage {
    pub taps: usize,
    pub macs: usize,
    pub ips: usize,
}

impl PoolUsage {
    /// True when nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.taps == 0 && self.macs == 0 && self.ips == 0
    }
}

struct Pools {
    taps: TapPool,
    macs: MacPool,
    ips: Ipv4Pool,
    tap_owners: HashMap<TapName, VmId>,
    mac_owners: HashMap<MacAddr, VmId>,
    ip_owners: HashMap<Ipv4Addr, VmId>,
}

impl Pools {
    fn ensure_available(&self, taps: bool, addresses: bool) -> Result<(), AllocError> {
        if taps && self.taps.available() == 0 {
            return Err(AllocError::Exhausted(PoolKind::Tap));
        }
        if addresses && self.macs.available() == 0 {
            return Err(AllocError::Exhausted(PoolKind::Mac));
        }
        if addresses && self.ips.available() == 0 {
            return Err(AllocError::Exhausted(PoolKind::Ip));
        }
        Ok(())
    }

    fn take_tap(&mut self, vm_id: VmId) -> Result<TapName, AllocError> {
        let tap = self
            .taps
            .allocate()
            .map_err(|_| AllocError::Exhausted(PoolKind::Tap))?;
        self.tap_owners.insert(tap.clone(), vm_id);
        Ok(tap)
    }

    fn take_addresses(&mut self, vm_id: VmId) -> Result<(MacAddr, Ipv4Addr), AllocError> {
        let mac = self
            .macs
            .allocate()
            .map_err(|_| AllocError::Exhausted(PoolKind::Mac))?;
        let ip = match self.ips.allocate() {
            Ok(ip) => ip,
            Err(_) => {
                self.macs.release(&mac);
                return Err(AllocError::Exhausted(PoolKind::Ip));
            }
        };
        self.mac_owners.insert(mac, vm_id);
        self.ip_owners.insert(ip, vm_id);
        Ok((mac, ip))
    }

    fn drop_tap(&mut self, tap: &TapName) {
        self.taps.release(tap);
        self.tap_owners.remove(tap);
    }

    fn drop_addresses(&mut self, mac: &MacAddr, ip: &Ipv4Addr) {
        self.macs.release(mac);
        self.mac_owners.remove(mac);
        self.ips.release(ip);
        self.ip_owners.remove(ip);
    }
}

/// Shared allocator for TAP names, MAC addresses and guest IPs.
pub struct ResourceAllocator {
    subnet: Ipv4Subnet,
    pools: Mutex<Pools>,
}

impl ResourceAllocator {
    /// Create an allocator with all pools empty.
    pub fn new(config: PoolConfig) -> Self {
        let pools = Pools {
            taps: TapPool::new(config.taps),
            macs: MacPool::new(config.macs),
            ips: Ipv4Pool::new(config.subnet),
            tap_owners: HashMap::new(),
            mac_owners: HashMap::new(),
            ip_owners: HashMap::new(),
        };
        Self {
            subnet: config.subnet,
            pools: Mutex::new(pools),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pools> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Guest subnet addresses are drawn from.
    pub fn subnet(&self) -> Ipv4Subnet {
        self.subnet
    }

    /// Allocate a TAP name, MAC and IP for a VM, all or nothing.
    pub fn allocate(&self, vm_id: VmId) -> Result<NetworkLease, AllocError> {
        let mut pools = self.lock();
        pools.ensure_available(true, true)?;

        let tap = pools.take_tap(vm_id)?;
        let (mac, ip) = match pools.take_addresses(vm_id) {
            Ok(addresses) => addresses,
            Err(e) => {
                pools.drop_tap(&tap);
                return Err(e);
            }
        };

        debug!(vm_id = %vm_id, tap = %tap, mac = %mac, ip = %ip, "Allocated network lease");
        Ok(NetworkLease { tap, mac, ip })
    }

    /// Allocate only a TAP name (restart after stop).
    pub fn allocate_tap(&self, vm_id: VmId) -> Result<TapName, AllocError> {
        let mut pools = self.lock();
        pools.ensure_available(true, false)?;
        let tap = pools.take_tap(vm_id)?;
        debug!(vm_id = %vm_id, tap = %tap, "Allocated TAP name");
        Ok(tap)
    }

    /// Allocate only a MAC and IP (after idle reclamation).
    pub fn allocate_addresses(&self, vm_id: VmId) -> Result<(MacAddr, Ipv4Addr), AllocError> {
        let mut pools = self.lock();
        pools.ensure_available(false, true)?;
        let (mac, ip) = pools.take_addresses(vm_id)?;
        debug!(vm_id = %vm_id, mac = %mac, ip = %ip, "Allocated addresses");
        Ok((mac, ip))
    }

    /// Claim a specific IP for a VM together with either a specific MAC or
    /// a fresh one (state recovery). Returns the MAC that is now held.
    ///
    /// Re-claiming values the same VM already holds succeeds.
    pub fn reserve_addresses(
        &self,
        vm_id: VmId,
        mac: Option<MacAddr>,
        ip: Ipv4Addr,
    ) -> Result<MacAddr, AllocError> {
        let mut pools = self.lock();

        if let Some(owner) = pools.ip_owners.get(&ip).filter(|owner| **owner != vm_id) {
            return Err(AllocError::Conflict {
                value: ip.to_string(),
                owner: *owner,
            });
        }
        if let Some(mac) = mac {
            if let Some(owner) = pools.mac_owners.get(&mac).filter(|owner| **owner != vm_id) {
                return Err(AllocError::Conflict {
                    value: mac.to_string(),
                    owner: *owner,
                });
            }
        }

        let ip_held = pools.ip_owners.contains_key(&ip);
        if !ip_held {
            pools.ips.claim(&ip)?;
        }

        let claimed = match mac {
            Some(mac) if pools.mac_owners.contains_key(&mac) => Ok(mac),
            Some(mac) => pools.macs.claim(&mac).map(|()| mac).map_err(AllocError::from),
            None => pools
                .macs
                .allocate()
                .map_err(|_| AllocError::Exhausted(PoolKind::Mac)),
        };
        let mac = match claimed {
            Ok(mac) => mac,
            Err(e) => {
                if !ip_held {
                    pools.ips.release(&ip);
                }
                return Err(e);
            }
        };

        pools.mac_owners.insert(mac, vm_id);
        pools.ip_owners.insert(ip, vm_id);
        debug!(vm_id = %vm_id, mac = %mac, ip = %ip, "Reserved addresses");
        Ok(mac)
    }

    /// Release a full lease. Idempotent.
    pub fn release(&self, lease: &NetworkLease) {
        let mut pools = self.lock();
        pools.drop_tap(&lease.tap);
        pools.drop_addresses(&lease.mac, &lease.ip);
        debug!(tap = %lease.tap, mac = %lease.mac, ip = %lease.ip, "Released network lease");
    }

    /// Release a TAP name. Idempotent.
    pub fn release_tap(&self, tap: &TapName) {
        self.lock().drop_tap(tap);
        debug!(tap = %tap, "Released TAP name");
    }

    /// Release a MAC and IP. Idempotent.
    pub fn release_addresses(&self, mac: &MacAddr, ip: &Ipv4Addr) {
        self.lock().drop_addresses(mac, ip);
        debug!(mac = %mac, ip = %ip, "Released addresses");
    }

    /// VM currently holding an IP, if any.
    pub fn owner_of_ip(&self, ip: &Ipv4Addr) -> Option<VmId> {
        self.lock().ip_owners.get(ip).copied()
    }

    /// VM currently holding a TAP name, if any.
    pub fn owner_of_tap(&self, tap: &TapName) -> Option<VmId> {
        self.lock().tap_owners.get(tap).copied()
    }

    /// In-use counts per pool.
    pub fn in_use(&self) -> PoolUsage {
        let pools = self.lock();
        PoolUsage {
            taps: pools.taps.in_use(),
            macs: pools.macs.in_use(),
            ips: pools.ips.in_use(),
        }
    }
}

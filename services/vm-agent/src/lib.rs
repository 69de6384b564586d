//! ember VM agent library
//!
//! The agent manages the lifecycle of Firecracker microVMs on a single
//! host: it hands out host-local network identity (TAP device, MAC, IPv4),
//! renders the hypervisor configuration, supervises the `firecracker`
//! process and keeps a durable record of every VM.
//!
//! ## Architecture
//!
//! ```text
//! VmManager
//! ├── ResourceAllocator   (TAP / MAC / IP pools, one lock)
//! ├── TapDriver           (ip tuntap, or a mock)
//! ├── config::build       (--config-file document)
//! ├── ProcessSupervisor   (spawn, exit watcher, terminate)
//! └── StateStore          (SQLite VM records)
//! ```
//!
//! ## Modules
//!
//! - `allocator`: network identity pools
//! - `firecracker`: hypervisor config and process supervision
//! - `lifecycle`: state machine and the VM manager
//! - `network`: TAP device drivers
//! - `state`: durable VM records

pub mod allocator;
pub mod config;
pub mod error;
pub mod firecracker;
pub mod lifecycle;
pub mod network;
pub mod state;

// Re-export commonly used types
pub use allocator::{NetworkLease, PoolConfig, PoolUsage, ResourceAllocator};
pub use error::{ErrorKind, LifecycleError, Phase};
pub use lifecycle::{
    AddressRetention, ManagerConfig, RuntimeSnapshot, SpecDefaults, VmManager, VmSpec,
};
pub use network::{IpTapDriver, MockTapDriver, TapDriver};
pub use state::{SqliteStateStore, StateStore, VmRecord, VmStatus};

//! Firecracker integration.
//!
//! ## Components
//!
//! - `config`: the `--config-file` document (boot source, drives, machine
//!   config, network interfaces)
//! - `process`: spawning, watching and terminating `firecracker` processes
//!
//! The agent configures each VM entirely through the config file, so no
//! API calls are made over the control socket.

pub mod config;
mod process;

pub use config::{ConfigError, HypervisorConfig};
pub use process::{
    ProcessExit, ProcessHandle, ProcessSupervisor, SpawnError, SupervisorConfig, TerminateError,
};

//! Test harness for VM agent integration tests.
//!
//! Builds a [`VmManager`] against:
//! - a shell script standing in for the firecracker binary
//! - a [`MockTapDriver`] so no host devices are touched
//! - a file-backed SQLite store wrapped in [`FlakyStore`] for fault injection
//!
//! Everything lives in a temporary directory that is removed on drop.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ember_id::VmId;
use ember_networking::{Ipv4Subnet, MacRange, TapName, TapRange};
use ember_vm_agent::allocator::{PoolConfig, ResourceAllocator};
use ember_vm_agent::firecracker::{ProcessSupervisor, SupervisorConfig};
use ember_vm_agent::lifecycle::{AddressRetention, ManagerConfig, SpecDefaults};
use ember_vm_agent::network::{MockTapDriver, TapDriver, TapError};
use ember_vm_agent::state::{SqliteStateStore, StateStore, StateStoreError, VmRecord};
use ember_vm_agent::VmManager;
use tempfile::TempDir;

/// Behaves like a healthy hypervisor: creates its control socket, then idles
/// until signalled.
pub const HEALTHY_FIRECRACKER: &str = "touch \"$2\"\nexec sleep 600";

/// Exits straight away, the way firecracker does on a bad config.
pub const BROKEN_FIRECRACKER: &str = "echo 'bad config' >&2\nexit 1";

// ============================================================================
// Fault-injecting store
// ============================================================================

/// SQLite store whose writes can be made to fail on demand.
pub struct FlakyStore {
    inner: SqliteStateStore,
    fail_creates: AtomicBool,
    fail_updates: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FlakyStore {
    pub fn open(path: &Path) -> Self {
        Self {
            inner: SqliteStateStore::open(path).expect("open state store"),
            fail_creates: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    fn injected(flag: &AtomicBool) -> Result<(), StateStoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StateStoreError::Invalid("injected store failure".to_string()));
        }
        Ok(())
    }
}

impl StateStore for FlakyStore {
    fn create_vm(&self, record: &VmRecord) -> Result<(), StateStoreError> {
        Self::injected(&self.fail_creates)?;
        self.inner.create_vm(record)
    }

    fn update_vm(&self, record: &VmRecord) -> Result<(), StateStoreError> {
        Self::injected(&self.fail_updates)?;
        self.inner.update_vm(record)
    }

    fn get_vm(&self, vm_id: &VmId) -> Result<VmRecord, StateStoreError> {
        self.inner.get_vm(vm_id)
    }

    fn list_vms(&self) -> Result<Vec<VmRecord>, StateStoreError> {
        self.inner.list_vms()
    }

    fn delete_vm(&self, vm_id: &VmId) -> Result<(), StateStoreError> {
        Self::injected(&self.fail_deletes)?;
        self.inner.delete_vm(vm_id)
    }
}

// ============================================================================
// Slow TAP driver
// ============================================================================

/// Stalls after every device create so a caller can be cancelled while the
/// device already exists. A zero delay passes straight through.
pub struct SlowTapDriver {
    inner: Arc<MockTapDriver>,
    delay_ms: AtomicU64,
}

impl SlowTapDriver {
    pub fn new(inner: Arc<MockTapDriver>, delay: Duration) -> Self {
        Self {
            inner,
            delay_ms: AtomicU64::new(delay.as_millis() as u64),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl TapDriver for SlowTapDriver {
    async fn create(&self, name: &TapName, bridge: Option<&str>) -> Result<(), TapError> {
        self.inner.create(name, bridge).await?;
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }

    async fn delete(&self, name: &TapName) -> Result<(), TapError> {
        self.inner.delete(name).await
    }
}

// ============================================================================
// Test host
// ============================================================================

/// Knobs for [`TestHost`].
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub subnet: &'static str,
    pub mac_pool: usize,
    pub tap_pool: usize,
    pub script: &'static str,
    pub retention: AddressRetention,
    pub tap_delay: Option<Duration>,
    pub bridge: Option<&'static str>,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            subnet: "10.99.0.0/24",
            mac_pool: 64,
            tap_pool: 64,
            script: HEALTHY_FIRECRACKER,
            retention: AddressRetention::Indefinite,
            tap_delay: None,
            bridge: None,
        }
    }
}

/// A VM manager wired to fakes inside a temporary directory.
pub struct TestHost {
    pub manager: Arc<VmManager>,
    pub taps: Arc<MockTapDriver>,
    pub store: Arc<FlakyStore>,
    pub socket_dir: PathBuf,
    pub options: HostOptions,
    slow_taps: Arc<SlowTapDriver>,
    dir: TempDir,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_options(HostOptions::default())
    }

    pub fn with_options(options: HostOptions) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let socket_dir = dir.path().join("run");
        write_script(&binary_path(dir.path()), options.script);

        let store = Arc::new(FlakyStore::open(&database_path(dir.path())));
        let taps = Arc::new(MockTapDriver::new());
        let (manager, slow_taps) =
            build_manager(dir.path(), &socket_dir, &options, taps.clone(), store.clone());

        Self {
            manager,
            taps,
            store,
            socket_dir,
            options,
            slow_taps,
            dir,
        }
    }

    /// Root of the temporary directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Replace the manager with a fresh one over the same database and
    /// directory, as if the agent process had been restarted.
    ///
    /// Dropping the old manager kills any hypervisor it was supervising
    /// without recording the exit.
    pub fn restart(&mut self) {
        let store = Arc::new(FlakyStore::open(&database_path(self.dir.path())));
        let taps = Arc::new(MockTapDriver::new());
        let (manager, slow_taps) = build_manager(
            self.dir.path(),
            &self.socket_dir,
            &self.options,
            taps.clone(),
            store.clone(),
        );
        self.manager = manager;
        self.slow_taps = slow_taps;
        self.taps = taps;
        self.store = store;
    }

    /// Swap the hypervisor stand-in.
    pub fn set_script(&mut self, script: &'static str) {
        self.options.script = script;
        write_script(&binary_path(self.dir.path()), script);
    }

    /// Change how long each TAP create stalls after the device appears.
    pub fn set_tap_delay(&self, delay: Duration) {
        self.slow_taps.set_delay(delay);
    }

    /// File names currently in the socket directory.
    pub fn artifacts(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.socket_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn binary_path(root: &Path) -> PathBuf {
    root.join("firecracker")
}

fn database_path(root: &Path) -> PathBuf {
    root.join("state.db")
}

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");
}

fn build_manager(
    root: &Path,
    socket_dir: &Path,
    options: &HostOptions,
    taps: Arc<MockTapDriver>,
    store: Arc<FlakyStore>,
) -> (Arc<VmManager>, Arc<SlowTapDriver>) {
    let pools = PoolConfig {
        subnet: Ipv4Subnet::from_cidr(options.subnet).expect("subnet"),
        macs: MacRange::new([0x02, 0xfc, 0x00], options.mac_pool).expect("mac range"),
        taps: TapRange::new("fc-tap", options.tap_pool).expect("tap range"),
    };
    let supervisor = ProcessSupervisor::new(SupervisorConfig {
        binary: binary_path(root),
        spawn_probe: Duration::from_millis(150),
        socket_timeout: Some(Duration::from_secs(2)),
        kill_timeout: Duration::from_secs(2),
    });
    let config = ManagerConfig {
        socket_dir: socket_dir.to_path_buf(),
        kernel_path: root.join("vmlinux.bin"),
        rootfs_path: root.join("rootfs.ext4"),
        bridge_name: options.bridge.map(str::to_string),
        defaults: SpecDefaults::default(),
        stop_grace: Duration::from_secs(2),
        address_retention: options.retention,
    };

    let slow_taps = Arc::new(SlowTapDriver::new(
        taps,
        options.tap_delay.unwrap_or(Duration::ZERO),
    ));

    let manager = VmManager::new(
        config,
        ResourceAllocator::new(pools),
        supervisor,
        slow_taps.clone(),
        store,
    );
    (manager, slow_taps)
}

// ============================================================================
// Helpers
// ============================================================================

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Kill a process behind the agent's back.
pub fn kill_out_of_band(pid: u32) {
    // SAFETY: plain kill(2) on a pid owned by this test.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    assert_eq!(rc, 0, "kill -KILL {pid} failed");
}

/// Whether a pid still refers to a live (non-zombie) process.
pub fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // state is the field after the parenthesised command name
        Ok(stat) => stat
            .rsplit_once(") ")
            .and_then(|(_, rest)| rest.chars().next())
            .is_some_and(|state| state != 'Z'),
        Err(_) => false,
    }
}

//! VM lifecycle management.
//!
//! [`VmManager`] coordinates the allocator, the TAP driver, the config
//! builder, the process supervisor and the state store. All mutating
//! operations on one VM are serialized by that VM's slot lock; operations on
//! different VMs run in parallel.
//!
//! ## Ordering
//!
//! - create: record `creating`, allocate, TAP device, render, persist
//!   artifact, record `created`. Any failure rolls back everything before it
//!   and records `error`.
//! - start: re-acquire what stop released, re-render, spawn, write record.
//! - stop: terminate, release the TAP, write record. MAC and IP stay.
//! - delete: terminate, remove record, release everything, remove files.
//!
//! Host resources are released only after the hypervisor is confirmed gone.

mod entry;
mod spec;
pub mod state;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ember_id::VmId;
use ember_networking::{MacAddr, TapName};
use futures_util::future::join_all;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::allocator::{NetworkLease, PoolUsage, ResourceAllocator};
use crate::error::{ErrorKind, LifecycleError, Phase};
use crate::firecracker::{config, HypervisorConfig, ProcessExit, ProcessSupervisor};
use crate::network::TapDriver;
use crate::state::{StateStore, VmRecord, VmStatus};

pub use entry::{ArtifactPaths, RuntimeEntry, RuntimeSnapshot};
pub use spec::{SpecDefaults, VmSpec};
pub use state::{transition, InvalidTransition, LifecycleEvent};

use entry::{remove_artifact, write_atomic};
use state::can_start;

/// How long a stopped VM keeps its MAC and IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressRetention {
    /// Until the VM is deleted.
    #[default]
    Indefinite,
    /// Until the VM has been stopped for this long.
    IdleFor(Duration),
}

/// Lifecycle manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory for sockets, config files and logs.
    pub socket_dir: PathBuf,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    /// Host bridge for TAP devices, if any.
    pub bridge_name: Option<String>,
    pub defaults: SpecDefaults,
    /// Time between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    pub address_retention: AddressRetention,
}

/// Outcome of [`VmManager::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records with a runtime entry rebuilt.
    pub recovered: usize,
    /// Of those, records moved to `error`.
    pub marked_error: usize,
}

/// Outcome of [`VmManager::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: usize,
    pub failed: usize,
    pub timed_out: usize,
}

type Slot = Arc<Mutex<Option<RuntimeEntry>>>;

/// Timestamp at the precision the store keeps.
fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Undoes a partial create unless disarmed.
///
/// Holds the new VM's slot lock for the whole create, so no other operation
/// sees the VM until it is either provisioned or rolled back. Dropping an
/// armed guard (the caller's future was cancelled) schedules the rollback on
/// the runtime.
struct ProvisionGuard {
    allocator: Arc<ResourceAllocator>,
    taps: Arc<dyn TapDriver>,
    store: Arc<dyn StateStore>,
    /// The `creating` record as first written.
    record: VmRecord,
    paths: ArtifactPaths,
    slot: Option<OwnedMutexGuard<Option<RuntimeEntry>>>,
    lease: Option<NetworkLease>,
    /// Set before the device is requested, so a cancelled request is undone too.
    tap_created: bool,
    artifacts: Vec<PathBuf>,
}

impl ProvisionGuard {
    /// Hand the provisioned entry to the runtime table.
    fn disarm(mut self, entry: RuntimeEntry) {
        if let Some(mut slot) = self.slot.take() {
            *slot = Some(entry);
        }
        self.lease = None;
        self.tap_created = false;
        self.artifacts.clear();
    }

    /// Undo the create and record why. Returns the VM's durable status.
    async fn rollback(mut self, reason: String) -> VmStatus {
        // runs to completion even if the caller is cancelled meanwhile
        match tokio::spawn(self.take_work().run(reason)).await {
            Ok(status) => status,
            Err(e) => {
                error!(vm_id = %self.record.id, error = %e, "Create rollback task failed");
                VmStatus::Creating
            }
        }
    }

    fn take_work(&mut self) -> RollbackWork {
        RollbackWork {
            allocator: self.allocator.clone(),
            taps: self.taps.clone(),
            store: self.store.clone(),
            record: self.record.clone(),
            paths: self.paths.clone(),
            slot: self.slot.take(),
            lease: self.lease.take(),
            tap_created: std::mem::take(&mut self.tap_created),
            artifacts: std::mem::take(&mut self.artifacts),
        }
    }
}

impl Drop for ProvisionGuard {
    fn drop(&mut self) {
        if self.slot.is_none() {
            return;
        }
        let work = self.take_work();
        warn!(vm_id = %work.record.id, "Create abandoned, rolling back");
        let reason = "create abandoned before completion".to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(work.run(reason));
            }
            Err(_) => {
                work.finish(reason);
            }
        }
    }
}

struct RollbackWork {
    allocator: Arc<ResourceAllocator>,
    taps: Arc<dyn TapDriver>,
    store: Arc<dyn StateStore>,
    record: VmRecord,
    paths: ArtifactPaths,
    slot: Option<OwnedMutexGuard<Option<RuntimeEntry>>>,
    lease: Option<NetworkLease>,
    tap_created: bool,
    artifacts: Vec<PathBuf>,
}

impl RollbackWork {
    async fn run(self, reason: String) -> VmStatus {
        if let (true, Some(lease)) = (self.tap_created, &self.lease) {
            if let Err(e) = self.taps.delete(&lease.tap).await {
                warn!(vm_id = %self.record.id, tap = %lease.tap, error = %e, "Failed to delete TAP device during rollback");
            }
        }
        self.finish(reason)
    }

    /// Everything except device removal.
    fn finish(mut self, reason: String) -> VmStatus {
        let vm_id = self.record.id;
        for path in &self.artifacts {
            remove_artifact(path);
        }
        if let Some(lease) = &self.lease {
            self.allocator.release(lease);
        }

        let record = &mut self.record;
        record.status = transition(VmStatus::Creating, LifecycleEvent::ProvisionFailed)
            .unwrap_or(VmStatus::Error);
        record.ip_address = None;
        record.last_error = Some(reason);
        record.updated_at = now();
        let durable = match self.store.update_vm(record) {
            Ok(()) => record.status,
            Err(e) => {
                error!(vm_id = %vm_id, error = %e, "Failed to record create failure");
                VmStatus::Creating
            }
        };

        // an empty entry keeps the failed VM deletable
        if let Some(mut slot) = self.slot.take() {
            *slot = Some(RuntimeEntry::new(vm_id, self.paths.clone()));
        }
        debug!(vm_id = %vm_id, status = %durable, "Rolled back partial create");
        durable
    }
}

/// Single-host VM lifecycle manager.
pub struct VmManager {
    this: Weak<VmManager>,
    config: ManagerConfig,
    allocator: Arc<ResourceAllocator>,
    supervisor: ProcessSupervisor,
    taps: Arc<dyn TapDriver>,
    store: Arc<dyn StateStore>,
    table: RwLock<HashMap<VmId, Slot>>,
}

impl VmManager {
    pub fn new(
        config: ManagerConfig,
        allocator: ResourceAllocator,
        supervisor: ProcessSupervisor,
        taps: Arc<dyn TapDriver>,
        store: Arc<dyn StateStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            allocator: Arc::new(allocator),
            supervisor,
            taps,
            store,
            table: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    /// In-use counts of the resource pools.
    pub fn pool_usage(&self) -> PoolUsage {
        self.allocator.in_use()
    }

    pub fn artifact_paths(&self, vm_id: &VmId) -> ArtifactPaths {
        ArtifactPaths::for_vm(&self.config.socket_dir, vm_id)
    }

    fn slot(&self, vm_id: &VmId) -> Option<Slot> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(vm_id)
            .cloned()
    }

    fn slots(&self) -> Vec<(VmId, Slot)> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect()
    }

    fn load_record(&self, vm_id: &VmId) -> Result<VmRecord, LifecycleError> {
        self.store
            .get_vm(vm_id)
            .map_err(|e| LifecycleError::new(Phase::Lookup, e).vm(*vm_id))
    }

    fn render(
        &self,
        spec: &VmSpec,
        mac: &MacAddr,
        ip: Ipv4Addr,
        tap: &TapName,
        paths: &ArtifactPaths,
    ) -> Result<String, LifecycleError> {
        let subnet = self.allocator.subnet();
        config::build(spec, mac, tap, &self.config.kernel_path, &self.config.rootfs_path)
            .map_err(|e| LifecycleError::new(Phase::Render, e))?
            .with_guest_network(ip, subnet.gateway(), subnet.netmask())
            .to_json()
            .map_err(|e| LifecycleError::artifact(Phase::Render, &paths.config, e.into()))
    }

    fn persist(&self, paths: &ArtifactPaths, json: &str) -> Result<(), LifecycleError> {
        std::fs::create_dir_all(&self.config.socket_dir)
            .and_then(|()| write_atomic(&paths.config, json))
            .map_err(|e| LifecycleError::artifact(Phase::Persist, &paths.config, e))
    }

    fn validate(&self, spec: &VmSpec) -> Result<(), LifecycleError> {
        let invalid = |msg: String| LifecycleError::new(Phase::Validate, ErrorKind::InvalidSpec(msg));
        spec.validate().map_err(invalid)?;
        if self.config.kernel_path.as_os_str().is_empty() {
            return Err(invalid("kernel path is empty".to_string()));
        }
        if self.config.rootfs_path.as_os_str().is_empty() {
            return Err(invalid("rootfs path is empty".to_string()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // create
    // ------------------------------------------------------------------

    /// Provision a new VM and record it as `created`.
    ///
    /// The VM is recorded as `creating` before anything is acquired. On
    /// failure every acquired resource and artifact is released and the
    /// record moves to `error`; the error carries that durable status. Only
    /// a spec rejected by validation or a failed first record write leaves
    /// no record behind.
    pub async fn create(&self, spec: VmSpec) -> Result<VmRecord, LifecycleError> {
        let spec = spec.with_defaults(&self.config.defaults);
        self.validate(&spec)?;

        let vm_id = VmId::new();
        let created_at = now();
        let mut record = VmRecord {
            id: vm_id,
            name: spec.name.clone(),
            status: VmStatus::Creating,
            memory_mib: spec.memory_mib.unwrap_or(self.config.defaults.memory_mib),
            vcpu_count: spec.vcpu_count.unwrap_or(self.config.defaults.vcpu_count),
            disk_size_gib: spec.disk_size_gib.unwrap_or(self.config.defaults.disk_size_gib),
            ip_address: None,
            last_error: None,
            created_at,
            updated_at: created_at,
        };
        self.store
            .create_vm(&record)
            .map_err(|e| LifecycleError::new(Phase::Record, e).vm(vm_id))?;

        let slot: Slot = Arc::new(Mutex::new(None));
        let locked = slot.clone().lock_owned().await;
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(vm_id, slot);

        let paths = self.artifact_paths(&vm_id);
        let mut guard = ProvisionGuard {
            allocator: self.allocator.clone(),
            taps: self.taps.clone(),
            store: self.store.clone(),
            record: record.clone(),
            paths: paths.clone(),
            slot: Some(locked),
            lease: None,
            tap_created: false,
            artifacts: Vec::new(),
        };

        match self.provision(&spec, &mut record, &paths, &mut guard).await {
            Ok(lease) => {
                let mut entry = RuntimeEntry::new(vm_id, paths);
                entry.tap = Some(lease.tap);
                entry.addresses = Some((lease.mac, lease.ip));
                guard.disarm(entry);

                info!(
                    vm_id = %vm_id,
                    name = %record.name,
                    memory_mib = record.memory_mib,
                    vcpus = record.vcpu_count,
                    ip = ?record.ip_address,
                    "VM created"
                );
                Ok(record)
            }
            Err(e) => {
                let status = guard.rollback(format!("create failed: {e}")).await;
                error!(vm_id = %vm_id, phase = %e.phase, status = %status, error = %e.kind, "VM create failed");
                Err(e.vm(vm_id).status(status))
            }
        }
    }

    async fn provision(
        &self,
        spec: &VmSpec,
        record: &mut VmRecord,
        paths: &ArtifactPaths,
        guard: &mut ProvisionGuard,
    ) -> Result<NetworkLease, LifecycleError> {
        let lease = self
            .allocator
            .allocate(record.id)
            .map_err(|e| LifecycleError::new(Phase::Allocate, e))?;
        guard.lease = Some(lease.clone());

        guard.tap_created = true;
        self.taps
            .create(&lease.tap, self.config.bridge_name.as_deref())
            .await
            .map_err(|e| LifecycleError::new(Phase::Network, e))?;

        let json = self.render(spec, &lease.mac, lease.ip, &lease.tap, paths)?;

        guard.artifacts.push(paths.config.clone());
        self.persist(paths, &json)?;

        record.status = transition(record.status, LifecycleEvent::Provisioned)
            .map_err(|e| LifecycleError::new(Phase::Record, e))?;
        record.ip_address = Some(lease.ip);
        record.updated_at = now();
        self.store
            .update_vm(record)
            .map_err(|e| LifecycleError::new(Phase::Record, e))?;

        Ok(lease)
    }

    // ------------------------------------------------------------------
    // start
    // ------------------------------------------------------------------

    /// Boot a VM. Starting a running VM is a no-op.
    pub async fn start(&self, vm_id: VmId) -> Result<VmRecord, LifecycleError> {
        let slot = self.slot(&vm_id).ok_or_else(|| LifecycleError::not_found(vm_id))?;
        let mut guard = slot.lock().await;
        let entry = guard.as_mut().ok_or_else(|| LifecycleError::not_found(vm_id))?;
        let mut record = self.load_record(&vm_id)?;

        if entry.process.is_some() {
            debug!(vm_id = %vm_id, "VM already running");
            return Ok(record);
        }
        let previous = record.status;
        if !can_start(previous) {
            return Err(LifecycleError::new(
                Phase::Lookup,
                InvalidTransition {
                    from: previous,
                    event: LifecycleEvent::Started,
                },
            )
            .vm(vm_id)
            .status(previous)
            .retained(true));
        }

        let fail = |phase: Phase, kind: ErrorKind| {
            LifecycleError::new(phase, kind)
                .vm(vm_id)
                .status(previous)
                .retained(true)
        };

        let (mac, ip) = match entry.addresses {
            Some(addresses) => addresses,
            None => {
                let addresses = self
                    .allocator
                    .allocate_addresses(vm_id)
                    .map_err(|e| fail(Phase::Allocate, e.into()))?;
                entry.addresses = Some(addresses);
                addresses
            }
        };

        let tap = self
            .ensure_tap(vm_id, entry)
            .await
            .map_err(|e| e.vm(vm_id).status(previous).retained(true))?;

        let spec = VmSpec::sized(
            record.name.clone(),
            record.memory_mib,
            record.vcpu_count,
            record.disk_size_gib,
        );
        let json = self
            .render(&spec, &mac, ip, &tap, &entry.paths)
            .map_err(|e| e.vm(vm_id).status(previous).retained(true))?;
        self.persist(&entry.paths, &json)
            .map_err(|e| e.vm(vm_id).status(previous).retained(true))?;

        record.ip_address = Some(ip);
        record.updated_at = now();

        let handle = match self
            .supervisor
            .spawn(&entry.paths.socket, &entry.paths.config, &entry.paths.log)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                let status = transition(previous, LifecycleEvent::SpawnFailed).unwrap_or(VmStatus::Error);
                record.status = status;
                record.last_error = Some(e.to_string());
                let durable = match self.store.update_vm(&record) {
                    Ok(()) => status,
                    Err(store_err) => {
                        error!(vm_id = %vm_id, error = %store_err, "Failed to record spawn failure");
                        previous
                    }
                };
                error!(vm_id = %vm_id, error = %e, "Hypervisor failed to start");
                return Err(fail(Phase::Spawn, e.into()).status(durable));
            }
        };

        record.status = transition(previous, LifecycleEvent::Started)
            .map_err(|e| fail(Phase::Spawn, e.into()))?;
        record.last_error = None;
        if let Err(e) = self.store.update_vm(&record) {
            error!(vm_id = %vm_id, error = %e, "Failed to record start, stopping hypervisor");
            if let Err(term) = handle.terminate(self.config.stop_grace).await {
                warn!(vm_id = %vm_id, error = %term, "Failed to stop unrecorded hypervisor");
            }
            return Err(fail(Phase::Record, e.into()));
        }

        entry.generation += 1;
        entry.stop_requested = false;
        entry.stopped_at = None;
        let pid = handle.pid();
        self.watch_exit(vm_id, entry.generation, handle.exit_watcher());
        entry.process = Some(handle);

        info!(vm_id = %vm_id, pid, tap = %tap, ip = %ip, "VM started");
        Ok(record)
    }

    /// The VM's TAP device, creating it if stop released it.
    ///
    /// The slot is reserved on the entry before the device is requested, so
    /// a cancelled start leaves it for stop or delete to release.
    async fn ensure_tap(&self, vm_id: VmId, entry: &mut RuntimeEntry) -> Result<TapName, LifecycleError> {
        let tap = match &entry.tap {
            Some(tap) if !entry.tap_pending => return Ok(tap.clone()),
            Some(tap) => {
                // an earlier start was cancelled mid-create
                let tap = tap.clone();
                self.delete_tap_device(&vm_id, &tap).await;
                tap
            }
            None => {
                let tap = self
                    .allocator
                    .allocate_tap(vm_id)
                    .map_err(|e| LifecycleError::new(Phase::Allocate, e))?;
                entry.tap = Some(tap.clone());
                tap
            }
        };

        entry.tap_pending = true;
        if let Err(e) = self
            .taps
            .create(&tap, self.config.bridge_name.as_deref())
            .await
        {
            entry.take_tap();
            self.allocator.release_tap(&tap);
            return Err(LifecycleError::new(Phase::Network, e));
        }
        entry.tap_pending = false;
        Ok(tap)
    }

    fn watch_exit(
        &self,
        vm_id: VmId,
        generation: u64,
        mut exit_rx: watch::Receiver<Option<ProcessExit>>,
    ) {
        let manager = self.this.clone();
        tokio::spawn(async move {
            let exit = match exit_rx.wait_for(Option::is_some).await {
                Ok(exit) => *exit,
                Err(_) => None,
            };
            let (Some(exit), Some(manager)) = (exit, manager.upgrade()) else {
                return;
            };
            manager.handle_exit(vm_id, generation, exit).await;
        });
    }

    /// React to a hypervisor exit observed by the watcher.
    async fn handle_exit(&self, vm_id: VmId, generation: u64, exit: ProcessExit) {
        let Some(slot) = self.slot(&vm_id) else {
            return;
        };
        let mut guard = slot.lock().await;
        let Some(entry) = guard.as_mut() else {
            return;
        };
        if entry.generation != generation || entry.process.is_none() {
            debug!(vm_id = %vm_id, generation, "Ignoring exit already handled by stop");
            return;
        }
        entry.process = None;

        let requested = exit.requested || entry.stop_requested;
        let mut record = match self.store.get_vm(&vm_id) {
            Ok(record) => record,
            Err(e) => {
                error!(vm_id = %vm_id, error = %e, "Failed to load record after hypervisor exit");
                return;
            }
        };
        let status = transition(record.status, LifecycleEvent::Exited { requested })
            .unwrap_or(VmStatus::Error);

        if requested {
            entry.stopped_at = Some(Instant::now());
            if let Some(tap) = entry.take_tap() {
                self.delete_tap_device(&vm_id, &tap).await;
                self.allocator.release_tap(&tap);
            }
            info!(vm_id = %vm_id, exit = %exit, "VM stopped");
        } else {
            error!(vm_id = %vm_id, exit = %exit, "Hypervisor exited unexpectedly");
            record.last_error = Some(format!("hypervisor exited unexpectedly ({exit})"));
        }

        record.status = status;
        record.updated_at = now();
        if let Err(e) = self.store.update_vm(&record) {
            error!(vm_id = %vm_id, error = %e, "Failed to record hypervisor exit");
        }
    }

    async fn delete_tap_device(&self, vm_id: &VmId, tap: &TapName) {
        if let Err(e) = self.taps.delete(tap).await {
            warn!(vm_id = %vm_id, tap = %tap, error = %e, "Failed to delete TAP device");
        }
    }

    // ------------------------------------------------------------------
    // stop
    // ------------------------------------------------------------------

    /// Stop a VM's hypervisor. Stopping a VM that is not running is a no-op.
    pub async fn stop(&self, vm_id: VmId) -> Result<VmRecord, LifecycleError> {
        let slot = self.slot(&vm_id).ok_or_else(|| LifecycleError::not_found(vm_id))?;
        let mut guard = slot.lock().await;
        let entry = guard.as_mut().ok_or_else(|| LifecycleError::not_found(vm_id))?;
        let mut record = self.load_record(&vm_id)?;

        let Some(handle) = entry.process.take() else {
            if record.status == VmStatus::Running {
                // an earlier stop lost its record write
                record.status = VmStatus::Stopped;
                record.updated_at = now();
                self.store.update_vm(&record).map_err(|e| {
                    LifecycleError::new(Phase::Record, e)
                        .vm(vm_id)
                        .status(VmStatus::Running)
                        .retained(true)
                })?;
            }
            debug!(vm_id = %vm_id, status = %record.status, "VM not running");
            return Ok(record);
        };

        let status = match transition(record.status, LifecycleEvent::Stopped) {
            Ok(status) => status,
            Err(e) => {
                entry.process = Some(handle);
                return Err(LifecycleError::new(Phase::Lookup, e)
                    .vm(vm_id)
                    .status(record.status)
                    .retained(true));
            }
        };

        entry.stop_requested = true;
        let pid = handle.pid();
        info!(vm_id = %vm_id, pid, "Stopping VM");
        if let Err(e) = handle.terminate(self.config.stop_grace).await {
            error!(vm_id = %vm_id, pid, error = %e, "Hypervisor did not stop");
            record.status = transition(record.status, LifecycleEvent::Failed).unwrap_or(VmStatus::Error);
            record.last_error = Some(e.to_string());
            record.updated_at = now();
            let durable = match self.store.update_vm(&record) {
                Ok(()) => record.status,
                Err(_) => VmStatus::Running,
            };
            return Err(LifecycleError::new(Phase::Terminate, e)
                .vm(vm_id)
                .status(durable)
                .retained(true));
        }

        entry.stopped_at = Some(Instant::now());
        if let Some(tap) = entry.take_tap() {
            self.delete_tap_device(&vm_id, &tap).await;
            self.allocator.release_tap(&tap);
        }

        let previous = record.status;
        record.status = status;
        record.updated_at = now();
        self.store.update_vm(&record).map_err(|e| {
            LifecycleError::new(Phase::Record, e)
                .vm(vm_id)
                .status(previous)
                .retained(true)
        })?;

        info!(vm_id = %vm_id, "VM stopped");
        Ok(record)
    }

    // ------------------------------------------------------------------
    // delete
    // ------------------------------------------------------------------

    /// Stop (if needed) and remove a VM with all its resources.
    pub async fn delete(&self, vm_id: VmId) -> Result<(), LifecycleError> {
        let slot = self.slot(&vm_id).ok_or_else(|| LifecycleError::not_found(vm_id))?;
        let mut guard = slot.lock().await;
        let entry = guard.as_mut().ok_or_else(|| LifecycleError::not_found(vm_id))?;
        let mut record = self.load_record(&vm_id)?;

        transition(record.status, LifecycleEvent::Deleted).map_err(|e| {
            LifecycleError::new(Phase::Lookup, e)
                .vm(vm_id)
                .status(record.status)
                .retained(true)
        })?;

        if let Some(handle) = entry.process.take() {
            entry.stop_requested = true;
            let pid = handle.pid();
            info!(vm_id = %vm_id, pid, "Stopping VM for delete");
            if let Err(e) = handle.terminate(self.config.stop_grace).await {
                error!(vm_id = %vm_id, pid, error = %e, "Hypervisor did not stop, keeping VM");
                record.status = VmStatus::Error;
                record.last_error = Some(e.to_string());
                record.updated_at = now();
                let durable = match self.store.update_vm(&record) {
                    Ok(()) => VmStatus::Error,
                    Err(_) => VmStatus::Running,
                };
                return Err(LifecycleError::new(Phase::Terminate, e)
                    .vm(vm_id)
                    .status(durable)
                    .retained(true));
            }
            entry.stopped_at = Some(Instant::now());
        }

        if let Err(e) = self.store.delete_vm(&vm_id) {
            if record.status == VmStatus::Running {
                // the process is gone; keep the record honest
                record.status = VmStatus::Stopped;
                record.updated_at = now();
                if self.store.update_vm(&record).is_err() {
                    record.status = VmStatus::Running;
                }
            }
            return Err(LifecycleError::new(Phase::Record, e)
                .vm(vm_id)
                .status(record.status)
                .retained(true));
        }

        if let Some(tap) = entry.take_tap() {
            self.delete_tap_device(&vm_id, &tap).await;
            self.allocator.release_tap(&tap);
        }
        if let Some((mac, ip)) = entry.addresses.take() {
            self.allocator.release_addresses(&mac, &ip);
        }
        entry.paths.remove_all();

        *guard = None;
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&vm_id);

        info!(vm_id = %vm_id, name = %record.name, "VM deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    pub fn get(&self, vm_id: VmId) -> Result<VmRecord, LifecycleError> {
        self.load_record(&vm_id)
    }

    /// All VMs, newest first.
    pub fn list(&self) -> Result<Vec<VmRecord>, LifecycleError> {
        self.store
            .list_vms()
            .map_err(|e| LifecycleError::new(Phase::Lookup, e))
    }

    /// Copy of every runtime entry.
    pub async fn runtime_snapshot(&self) -> Vec<RuntimeSnapshot> {
        let mut snapshots = Vec::new();
        for (_, slot) in self.slots() {
            if let Some(entry) = slot.lock().await.as_ref() {
                snapshots.push(entry.snapshot());
            }
        }
        snapshots.sort_by_key(|s| s.vm_id);
        snapshots
    }

    // ------------------------------------------------------------------
    // housekeeping
    // ------------------------------------------------------------------

    /// Rebuild runtime entries from the state store after an agent restart.
    ///
    /// No hypervisor survives a restart under supervision, so VMs recorded
    /// as running (or still creating) are moved to `error`.
    pub async fn recover(&self) -> Result<RecoveryReport, LifecycleError> {
        let mut records = self
            .store
            .list_vms()
            .map_err(|e| LifecycleError::new(Phase::Lookup, e))?;
        // oldest first, so the earliest holder of an address keeps it
        records.reverse();

        let mut report = RecoveryReport::default();
        for mut record in records {
            let vm_id = record.id;
            if self.slot(&vm_id).is_some() {
                continue;
            }

            let paths = self.artifact_paths(&vm_id);
            let rendered = std::fs::read_to_string(&paths.config)
                .ok()
                .and_then(|json| HypervisorConfig::from_json(&json).ok());
            if let Some(tap) = rendered.as_ref().and_then(HypervisorConfig::host_dev_name) {
                self.delete_tap_device(&vm_id, &tap).await;
            }

            let mut problem = None;
            let mut addresses = None;
            if let Some(ip) = record.ip_address {
                let mac = rendered.as_ref().and_then(HypervisorConfig::guest_mac);
                match self.allocator.reserve_addresses(vm_id, mac, ip) {
                    Ok(mac) => addresses = Some((mac, ip)),
                    Err(e) => {
                        warn!(vm_id = %vm_id, ip = %ip, error = %e, "Address conflict during recovery");
                        problem = Some(format!("address conflict during recovery: {e}"));
                        record.ip_address = None;
                    }
                }
            }
            if matches!(record.status, VmStatus::Running | VmStatus::Creating) {
                problem.get_or_insert(format!(
                    "agent restarted while VM was {}",
                    record.status
                ));
            }

            let mut entry = RuntimeEntry::new(vm_id, paths);
            entry.addresses = addresses;
            if record.status == VmStatus::Stopped {
                entry.stopped_at = Some(Instant::now());
            }

            if let Some(reason) = problem {
                record.status = transition(record.status, LifecycleEvent::Failed).unwrap_or(VmStatus::Error);
                record.last_error = Some(reason);
                record.updated_at = now();
                if let Err(e) = self.store.update_vm(&record) {
                    warn!(vm_id = %vm_id, error = %e, "Failed to record recovery outcome");
                }
                report.marked_error += 1;
            }

            self.table
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(vm_id, Arc::new(Mutex::new(Some(entry))));
            report.recovered += 1;
            debug!(vm_id = %vm_id, status = %record.status, "Recovered VM");
        }

        info!(
            recovered = report.recovered,
            marked_error = report.marked_error,
            "Recovery complete"
        );
        Ok(report)
    }

    /// Stop every running VM, each bounded by `per_vm_timeout`.
    pub async fn shutdown(&self, per_vm_timeout: Duration) -> ShutdownReport {
        let running: Vec<VmId> = self
            .runtime_snapshot()
            .await
            .into_iter()
            .filter(RuntimeSnapshot::is_running)
            .map(|s| s.vm_id)
            .collect();

        info!(count = running.len(), "Stopping running VMs");
        let results = join_all(running.into_iter().map(|vm_id| async move {
            (vm_id, tokio::time::timeout(per_vm_timeout, self.stop(vm_id)).await)
        }))
        .await;

        let mut report = ShutdownReport::default();
        for (vm_id, result) in results {
            match result {
                Ok(Ok(_)) => report.stopped += 1,
                Ok(Err(e)) => {
                    error!(vm_id = %vm_id, error = %e, "Failed to stop VM during shutdown");
                    report.failed += 1;
                }
                Err(_) => {
                    error!(vm_id = %vm_id, timeout_ms = per_vm_timeout.as_millis() as u64, "Timed out stopping VM during shutdown");
                    report.timed_out += 1;
                }
            }
        }
        report
    }

    /// Release MAC and IP of VMs that have been stopped longer than the
    /// retention period. Returns how many VMs gave up their addresses.
    pub async fn reclaim_idle_addresses(&self) -> usize {
        let AddressRetention::IdleFor(idle) = self.config.address_retention else {
            return 0;
        };

        let mut reclaimed = 0;
        for (vm_id, slot) in self.slots() {
            let mut guard = slot.lock().await;
            let Some(entry) = guard.as_mut() else {
                continue;
            };
            if entry.process.is_some() {
                continue;
            }
            let (Some(stopped_at), Some((mac, ip))) = (entry.stopped_at, entry.addresses) else {
                continue;
            };
            if stopped_at.elapsed() < idle {
                continue;
            }

            let mut record = match self.store.get_vm(&vm_id) {
                Ok(record) => record,
                Err(e) => {
                    warn!(vm_id = %vm_id, error = %e, "Skipping address reclamation");
                    continue;
                }
            };
            record.ip_address = None;
            record.updated_at = now();
            if let Err(e) = self.store.update_vm(&record) {
                warn!(vm_id = %vm_id, error = %e, "Skipping address reclamation");
                continue;
            }

            self.allocator.release_addresses(&mac, &ip);
            entry.addresses = None;
            reclaimed += 1;
            info!(vm_id = %vm_id, mac = %mac, ip = %ip, "Reclaimed idle addresses");
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_has_millisecond_precision() {
        let ts = now();
        assert_eq!(ts.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn test_address_retention_default() {
        assert_eq!(AddressRetention::default(), AddressRetention::Indefinite);
    }
}

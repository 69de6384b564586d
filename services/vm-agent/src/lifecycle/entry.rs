//! In-memory runtime state and on-disk artifacts of a VM.

use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ember_id::VmId;
use ember_networking::{MacAddr, TapName};
use serde::Serialize;
use tracing::warn;

use crate::firecracker::ProcessHandle;

/// Files the agent keeps for one VM under the socket directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    /// Firecracker control socket.
    pub socket: PathBuf,
    /// Rendered `--config-file` document.
    pub config: PathBuf,
    /// Hypervisor stdout/stderr.
    pub log: PathBuf,
}

impl ArtifactPaths {
    pub fn for_vm(dir: &Path, vm_id: &VmId) -> Self {
        let stem = vm_id.file_stem();
        Self {
            socket: dir.join(format!("{stem}.sock")),
            config: dir.join(format!("{stem}-config.json")),
            log: dir.join(format!("{stem}.log")),
        }
    }

    /// Remove every artifact, ignoring ones that do not exist.
    pub fn remove_all(&self) {
        for path in [&self.config, &self.socket, &self.log] {
            remove_artifact(path);
        }
        remove_artifact(&tmp_path(&self.config));
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Write `contents` so that readers see either the old or the new file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = tmp_path(path);
    if let Err(e) = std::fs::write(&tmp, contents).and_then(|()| std::fs::rename(&tmp, path)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Best-effort removal.
pub(crate) fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove VM artifact"),
    }
}

/// Runtime state of a created VM.
///
/// Exists from the end of create, successful or rolled back, until delete.
/// `process` is present exactly while the VM is running.
#[derive(Debug)]
pub struct RuntimeEntry {
    pub(crate) vm_id: VmId,
    pub(crate) paths: ArtifactPaths,
    /// Released on stop, re-acquired on start.
    pub(crate) tap: Option<TapName>,
    /// `tap` is reserved but its device may not exist yet.
    pub(crate) tap_pending: bool,
    /// Released only by delete or idle reclamation.
    pub(crate) addresses: Option<(MacAddr, Ipv4Addr)>,
    pub(crate) process: Option<ProcessHandle>,
    /// Bumped on every spawn so exits of older processes can be told apart.
    pub(crate) generation: u64,
    pub(crate) stop_requested: bool,
    pub(crate) stopped_at: Option<Instant>,
}

impl RuntimeEntry {
    pub(crate) fn new(vm_id: VmId, paths: ArtifactPaths) -> Self {
        Self {
            vm_id,
            paths,
            tap: None,
            tap_pending: false,
            addresses: None,
            process: None,
            generation: 0,
            stop_requested: false,
            stopped_at: None,
        }
    }

    /// Give up the TAP reservation, whether or not its device was created.
    pub(crate) fn take_tap(&mut self) -> Option<TapName> {
        self.tap_pending = false;
        self.tap.take()
    }

    pub(crate) fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            vm_id: self.vm_id,
            socket_path: self.paths.socket.clone(),
            config_path: self.paths.config.clone(),
            tap: self.tap.as_ref().map(ToString::to_string),
            mac: self.addresses.map(|(mac, _)| mac.to_string()),
            ip: self.addresses.map(|(_, ip)| ip),
            pid: self.process.as_ref().map(ProcessHandle::pid),
            generation: self.generation,
            stop_requested: self.stop_requested,
        }
    }
}

/// Point-in-time copy of a runtime entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeSnapshot {
    pub vm_id: VmId,
    pub socket_path: PathBuf,
    pub config_path: PathBuf,
    pub tap: Option<String>,
    pub mac: Option<String>,
    pub ip: Option<Ipv4Addr>,
    /// Hypervisor pid while running.
    pub pid: Option<u32>,
    pub generation: u64,
    pub stop_requested: bool,
}

impl RuntimeSnapshot {
    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_paths() {
        let id: VmId = "vm_01HV4Z4NYPLTRS0JTUA8XDME5F".parse().unwrap();
        let paths = ArtifactPaths::for_vm(Path::new("/tmp/firecracker"), &id);

        assert_eq!(
            paths.socket,
            PathBuf::from("/tmp/firecracker/vm_01HV4Z4NYPLTRS0JTUA8XDME5F.sock")
        );
        assert_eq!(
            paths.config,
            PathBuf::from("/tmp/firecracker/vm_01HV4Z4NYPLTRS0JTUA8XDME5F-config.json")
        );
        assert_eq!(
            paths.log,
            PathBuf::from("/tmp/firecracker/vm_01HV4Z4NYPLTRS0JTUA8XDME5F.log")
        );
    }

    #[test]
    fn test_write_atomic_replaces_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vm-config.json");

        write_atomic(&path, "{\"a\":1}").unwrap();
        write_atomic(&path, "{\"a\":2}").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_write_atomic_missing_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("vm-config.json");
        assert!(write_atomic(&path, "{}").is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_all_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        let id = VmId::new();
        let paths = ArtifactPaths::for_vm(dir.path(), &id);
        std::fs::write(&paths.config, "{}").unwrap();
        std::fs::write(&paths.log, "boot").unwrap();

        paths.remove_all();

        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_snapshot_of_idle_entry() {
        let id = VmId::new();
        let mut entry = RuntimeEntry::new(id, ArtifactPaths::for_vm(Path::new("/run"), &id));
        entry.tap = Some(TapName::new("fc-tap3").unwrap());
        entry.addresses = Some((
            "02:fc:00:00:00:04".parse().unwrap(),
            Ipv4Addr::new(192, 168, 100, 5),
        ));

        let snapshot = entry.snapshot();
        assert_eq!(snapshot.vm_id, id);
        assert_eq!(snapshot.tap.as_deref(), Some("fc-tap3"));
        assert_eq!(snapshot.mac.as_deref(), Some("02:fc:00:00:00:04"));
        assert_eq!(snapshot.ip, Some(Ipv4Addr::new(192, 168, 100, 5)));
        assert!(!snapshot.is_running());
    }
}

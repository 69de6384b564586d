//! Firecracker process supervision.
//!
//! Each hypervisor process is owned by a dedicated watcher task. The task
//! holds the `Child`, reaps it, and publishes the exit on a watch channel.
//! Signals are routed through the same task, so a pid is only ever
//! signalled while it is still our unreaped child.
//!
//! A [`ProcessHandle`] is the single owner-facing reference to a process.
//! `terminate` consumes it; dropping a live handle kills the process.

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Poll interval while waiting for the control socket.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the firecracker binary.
    pub binary: PathBuf,
    /// A process that exits within this window counts as a failed spawn.
    pub spawn_probe: Duration,
    /// How long to wait for the control socket. `None` skips the wait.
    pub socket_timeout: Option<Duration>,
    /// How long to wait for exit after SIGKILL.
    pub kill_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/bin/firecracker"),
            spawn_probe: Duration::from_millis(250),
            socket_timeout: Some(Duration::from_secs(5)),
            kill_timeout: Duration::from_secs(2),
        }
    }
}

/// How a hypervisor process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    /// Whether a stop had been requested before the exit.
    pub requested: bool,
}

impl ProcessExit {
    fn from_status(status: io::Result<ExitStatus>, requested: bool) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                signal: status.signal(),
                requested,
            },
            Err(_) => Self {
                code: None,
                signal: None,
                requested,
            },
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Errors starting a hypervisor process.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("hypervisor binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("hypervisor binary is not executable: {}", .0.display())]
    NotExecutable(PathBuf),

    #[error("failed to prepare {}: {source}", .path.display())]
    Prepare { path: PathBuf, source: io::Error },

    #[error("failed to spawn hypervisor: {0}")]
    Io(#[from] io::Error),

    #[error("hypervisor exited during startup ({0})")]
    EarlyExit(ProcessExit),

    #[error("control socket {} did not appear within {timeout:?}", .path.display())]
    SocketTimeout { path: PathBuf, timeout: Duration },
}

/// Errors stopping a hypervisor process.
#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("failed to signal pid {pid}: {source}")]
    Signal { pid: u32, source: io::Error },

    #[error("pid {pid} still running {timeout:?} after SIGKILL")]
    KillTimeout { pid: u32, timeout: Duration },

    #[error("watcher for pid {pid} went away without reporting an exit")]
    WatcherGone { pid: u32 },
}

struct SignalRequest {
    signal: libc::c_int,
    reply: oneshot::Sender<io::Result<()>>,
}

/// Handle to a running hypervisor process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    requested: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    signals: mpsc::Sender<SignalRequest>,
    kill_timeout: Duration,
}

impl fmt::Debug for SignalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalRequest")
            .field("signal", &self.signal)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit of the process, or `None` while it is still running.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Receiver that observes the exit without holding the handle.
    pub fn exit_watcher(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// Flag the coming exit as intentional.
    pub fn mark_stop_requested(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Stop the process: SIGTERM, wait `grace`, then SIGKILL.
    ///
    /// Succeeds immediately if the process has already exited.
    pub async fn terminate(self, grace: Duration) -> Result<ProcessExit, TerminateError> {
        self.mark_stop_requested();
        if let Some(exit) = self.exit_status() {
            return Ok(exit);
        }

        let mut exit_rx = self.exit_rx.clone();
        debug!(pid = self.pid, "Sending SIGTERM");
        self.signal(libc::SIGTERM).await?;

        match wait_for_exit(&mut exit_rx, grace).await {
            Ok(Some(exit)) => return Ok(exit),
            Ok(None) => return Err(TerminateError::WatcherGone { pid: self.pid }),
            Err(_) => {
                warn!(pid = self.pid, grace_ms = grace.as_millis() as u64, "Hypervisor ignored SIGTERM, sending SIGKILL");
            }
        }

        self.signal(libc::SIGKILL).await?;
        match wait_for_exit(&mut exit_rx, self.kill_timeout).await {
            Ok(Some(exit)) => Ok(exit),
            Ok(None) => Err(TerminateError::WatcherGone { pid: self.pid }),
            Err(_) => Err(TerminateError::KillTimeout {
                pid: self.pid,
                timeout: self.kill_timeout,
            }),
        }
    }

    async fn signal(&self, signal: libc::c_int) -> Result<(), TerminateError> {
        let (reply, response) = oneshot::channel();
        if self
            .signals
            .send(SignalRequest { signal, reply })
            .await
            .is_err()
        {
            // watcher already reaped the child
            return Ok(());
        }
        match response.await {
            Ok(Ok(())) | Err(_) => Ok(()),
            Ok(Err(e)) if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
            Ok(Err(source)) => Err(TerminateError::Signal {
                pid: self.pid,
                source,
            }),
        }
    }
}

/// Wait up to `timeout` for an exit. `Ok(None)` means the watcher vanished.
async fn wait_for_exit(
    exit_rx: &mut watch::Receiver<Option<ProcessExit>>,
    timeout: Duration,
) -> Result<Option<ProcessExit>, tokio::time::error::Elapsed> {
    tokio::time::timeout(timeout, async {
        match exit_rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            Err(_) => None,
        }
    })
    .await
}

fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions. The pid belongs to
    // a child that the calling task has not reaped yet.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Owns the child until it exits.
async fn watch_process(
    mut child: Child,
    pid: u32,
    mut signals: mpsc::Receiver<SignalRequest>,
    requested: Arc<AtomicBool>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let status = loop {
        tokio::select! {
            biased;
            status = child.wait() => break status,
            request = signals.recv() => match request {
                Some(request) => {
                    let _ = request.reply.send(send_signal(pid, request.signal));
                }
                None => {
                    // handle dropped while the process was alive
                    warn!(pid, "Hypervisor handle dropped, killing process");
                    if let Err(e) = child.start_kill() {
                        warn!(pid, error = %e, "Failed to kill orphaned hypervisor");
                    }
                    break child.wait().await;
                }
            }
        }
    };

    let exit = ProcessExit::from_status(status, requested.load(Ordering::SeqCst));
    info!(
        pid,
        code = ?exit.code,
        signal = ?exit.signal,
        requested = exit.requested,
        "Hypervisor process exited"
    );
    let _ = exit_tx.send(Some(exit));
}

/// Spawns and supervises Firecracker processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn check_binary(&self) -> Result<(), SpawnError> {
        let binary = &self.config.binary;
        let metadata = match std::fs::metadata(binary) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SpawnError::BinaryNotFound(binary.clone()))
            }
            Err(source) => {
                return Err(SpawnError::Prepare {
                    path: binary.clone(),
                    source,
                })
            }
        };
        if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
            return Err(SpawnError::NotExecutable(binary.clone()));
        }
        Ok(())
    }

    /// Start `{binary} --api-sock {socket} --config-file {config}`.
    ///
    /// Output goes to `log_path` (appended). Returns once the process has
    /// survived the startup probe and, if configured, its control socket
    /// exists.
    pub async fn spawn(
        &self,
        socket_path: &Path,
        config_path: &Path,
        log_path: &Path,
    ) -> Result<ProcessHandle, SpawnError> {
        self.check_binary()?;

        match std::fs::remove_file(socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "Removed stale control socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(SpawnError::Prepare {
                    path: socket_path.to_path_buf(),
                    source,
                })
            }
        }

        let prepare_log = |source| SpawnError::Prepare {
            path: log_path.to_path_buf(),
            source,
        };
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(prepare_log)?;
        let stderr = stdout.try_clone().map_err(prepare_log)?;

        let mut child = Command::new(&self.config.binary)
            .arg("--api-sock")
            .arg(socket_path)
            .arg("--config-file")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()?;

        let Some(pid) = child.id() else {
            let status = child.wait().await;
            return Err(SpawnError::EarlyExit(ProcessExit::from_status(status, false)));
        };

        let requested = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(None);
        let (signals_tx, signals_rx) = mpsc::channel(4);
        tokio::spawn(watch_process(
            child,
            pid,
            signals_rx,
            requested.clone(),
            exit_tx,
        ));

        let handle = ProcessHandle {
            pid,
            requested,
            exit_rx,
            signals: signals_tx,
            kill_timeout: self.config.kill_timeout,
        };
        debug!(pid, binary = %self.config.binary.display(), "Spawned hypervisor");

        let mut probe_rx = handle.exit_watcher();
        if let Ok(Some(exit)) = wait_for_exit(&mut probe_rx, self.config.spawn_probe).await {
            return Err(SpawnError::EarlyExit(exit));
        }

        if let Some(timeout) = self.config.socket_timeout {
            self.wait_for_socket(handle, socket_path, timeout).await
        } else {
            Ok(handle)
        }
    }

    async fn wait_for_socket(
        &self,
        handle: ProcessHandle,
        socket_path: &Path,
        timeout: Duration,
    ) -> Result<ProcessHandle, SpawnError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(exit) = handle.exit_status() {
                return Err(SpawnError::EarlyExit(exit));
            }
            if socket_path.exists() {
                return Ok(handle);
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }

        let pid = handle.pid();
        if let Err(e) = handle.terminate(Duration::ZERO).await {
            warn!(pid, error = %e, "Failed to kill hypervisor after socket timeout");
        }
        Err(SpawnError::SocketTimeout {
            path: socket_path.to_path_buf(),
            timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn supervisor(binary: PathBuf, socket_timeout: Option<Duration>) -> ProcessSupervisor {
        ProcessSupervisor::new(SupervisorConfig {
            binary,
            spawn_probe: Duration::from_millis(300),
            socket_timeout,
            kill_timeout: Duration::from_secs(2),
        })
    }

    async fn spawn_in(dir: &TempDir, supervisor: &ProcessSupervisor) -> Result<ProcessHandle, SpawnError> {
        supervisor
            .spawn(
                &dir.path().join("vm.sock"),
                &dir.path().join("vm-config.json"),
                &dir.path().join("vm.log"),
            )
            .await
    }

    // $2 is the --api-sock path
    const LONG_RUNNING: &str = "touch \"$2\"\nexec sleep 30";

    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let dir = TempDir::new().unwrap();
        let binary = script(&dir, "firecracker", LONG_RUNNING);
        let supervisor = supervisor(binary, Some(Duration::from_secs(2)));

        let handle = spawn_in(&dir, &supervisor).await.unwrap();
        assert!(handle.pid() > 0);
        assert!(handle.exit_status().is_none());
        assert!(dir.path().join("vm.sock").exists());

        let exit = handle.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(exit.requested);
        assert_eq!(exit.signal, Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(dir.path().join("nope"), None);

        let err = spawn_in(&dir, &supervisor).await.unwrap_err();
        assert!(matches!(err, SpawnError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_spawn_not_executable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("firecracker");
        fs::write(&path, "#!/bin/sh\n").unwrap();
        let supervisor = supervisor(path, None);

        let err = spawn_in(&dir, &supervisor).await.unwrap_err();
        assert!(matches!(err, SpawnError::NotExecutable(_)));
    }

    #[tokio::test]
    async fn test_spawn_early_exit() {
        let dir = TempDir::new().unwrap();
        let binary = script(&dir, "firecracker", "echo boom >&2\nexit 3");
        let supervisor = supervisor(binary, None);

        let err = spawn_in(&dir, &supervisor).await.unwrap_err();
        match err {
            SpawnError::EarlyExit(exit) => {
                assert_eq!(exit.code, Some(3));
                assert!(!exit.requested);
            }
            other => panic!("unexpected error: {other}"),
        }
        let log = fs::read_to_string(dir.path().join("vm.log")).unwrap();
        assert!(log.contains("boom"));
    }

    #[tokio::test]
    async fn test_spawn_socket_timeout() {
        let dir = TempDir::new().unwrap();
        let binary = script(&dir, "firecracker", "exec sleep 30");
        let supervisor = supervisor(binary, Some(Duration::from_millis(200)));

        let err = spawn_in(&dir, &supervisor).await.unwrap_err();
        assert!(matches!(err, SpawnError::SocketTimeout { .. }));
    }

    #[tokio::test]
    async fn test_spawn_removes_stale_socket() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("vm.sock"), "stale").unwrap();
        // never recreates the socket, so a surviving stale file would be seen
        let binary = script(&dir, "firecracker", "exec sleep 30");
        let supervisor = supervisor(binary, None);

        let handle = spawn_in(&dir, &supervisor).await.unwrap();
        assert!(!dir.path().join("vm.sock").exists());
        handle.terminate(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let dir = TempDir::new().unwrap();
        let binary = script(
            &dir,
            "firecracker",
            "trap '' TERM\ntouch \"$2\"\nwhile true; do sleep 0.05; done",
        );
        let supervisor = supervisor(binary, Some(Duration::from_secs(2)));

        let handle = spawn_in(&dir, &supervisor).await.unwrap();
        let exit = handle.terminate(Duration::from_millis(200)).await.unwrap();
        assert_eq!(exit.signal, Some(libc::SIGKILL));
        assert!(exit.requested);
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_ok() {
        let dir = TempDir::new().unwrap();
        let binary = script(&dir, "firecracker", LONG_RUNNING);
        let supervisor = supervisor(binary, Some(Duration::from_secs(2)));

        let handle = spawn_in(&dir, &supervisor).await.unwrap();
        send_signal(handle.pid(), libc::SIGKILL).unwrap();
        let mut exit_rx = handle.exit_watcher();
        wait_for_exit(&mut exit_rx, Duration::from_secs(2)).await.unwrap();

        let exit = handle.terminate(Duration::from_millis(100)).await.unwrap();
        assert_eq!(exit.signal, Some(libc::SIGKILL));
        assert!(!exit.requested);
    }

    #[tokio::test]
    async fn test_out_of_band_kill_is_observed() {
        let dir = TempDir::new().unwrap();
        let binary = script(&dir, "firecracker", LONG_RUNNING);
        let supervisor = supervisor(binary, Some(Duration::from_secs(2)));

        let handle = spawn_in(&dir, &supervisor).await.unwrap();
        let mut exit_rx = handle.exit_watcher();
        send_signal(handle.pid(), libc::SIGKILL).unwrap();

        let exit = wait_for_exit(&mut exit_rx, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert!(!exit.requested);
        assert_eq!(handle.exit_status(), Some(exit));
    }

    #[tokio::test]
    async fn test_dropping_handle_kills_process() {
        let dir = TempDir::new().unwrap();
        let binary = script(&dir, "firecracker", LONG_RUNNING);
        let supervisor = supervisor(binary, Some(Duration::from_secs(2)));

        let handle = spawn_in(&dir, &supervisor).await.unwrap();
        let mut exit_rx = handle.exit_watcher();
        drop(handle);

        let exit = wait_for_exit(&mut exit_rx, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.signal, Some(libc::SIGKILL));
    }
}

//! Error types for lifecycle operations.
//!
//! Component errors are folded into [`LifecycleError`], which also records
//! where the operation failed, which VM it concerned, the status the VM was
//! left in and whether it still holds host resources.

use std::fmt;
use std::path::PathBuf;

use ember_id::VmId;
use ember_networking::NetworkError;
use thiserror::Error;

use crate::allocator::AllocError;
use crate::firecracker::{ConfigError, SpawnError, TerminateError};
use crate::lifecycle::InvalidTransition;
use crate::network::TapError;
use crate::state::{StateStoreError, VmStatus};

/// Step of an operation at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validate,
    Lookup,
    Allocate,
    Network,
    Render,
    Persist,
    Record,
    Spawn,
    Terminate,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Validate => "validate",
            Phase::Lookup => "lookup",
            Phase::Allocate => "allocate",
            Phase::Network => "network",
            Phase::Render => "render",
            Phase::Persist => "persist",
            Phase::Record => "record",
            Phase::Spawn => "spawn",
            Phase::Terminate => "terminate",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What went wrong.
#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(AllocError),

    /// The requested value is held by another VM.
    #[error("resource conflict: {0}")]
    ResourceConflict(AllocError),

    /// The value does not belong to the pool.
    #[error("invalid resource: {0}")]
    InvalidResource(AllocError),

    #[error("hypervisor spawn failed: {0}")]
    SpawnFailed(#[source] SpawnError),

    #[error("network tool failed: {0}")]
    ExternalTool(#[source] TapError),

    #[error("state store failed: {0}")]
    StateStore(#[source] StateStoreError),

    #[error("artifact {} failed: {source}", .path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("VM not found: {0}")]
    NotFound(VmId),

    #[error(transparent)]
    InvalidTransition(InvalidTransition),

    #[error("hypervisor did not stop: {0}")]
    Terminate(#[source] TerminateError),
}

impl ErrorKind {
    /// Stable snake_case code for this kind.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidSpec(_) => "invalid_spec",
            ErrorKind::ResourceExhausted(_) => "resource_exhausted",
            ErrorKind::ResourceConflict(_) => "resource_conflict",
            ErrorKind::InvalidResource(_) => "invalid_resource",
            ErrorKind::SpawnFailed(_) => "spawn_failed",
            ErrorKind::ExternalTool(_) => "external_tool_failed",
            ErrorKind::StateStore(_) => "state_store_failed",
            ErrorKind::Artifact { .. } => "artifact_io_failed",
            ErrorKind::NotFound(_) => "not_found",
            ErrorKind::InvalidTransition(_) => "invalid_transition",
            ErrorKind::Terminate(_) => "terminate_failed",
        }
    }
}

impl From<ConfigError> for ErrorKind {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidSpec(msg) => ErrorKind::InvalidSpec(msg),
        }
    }
}

impl From<AllocError> for ErrorKind {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::Exhausted(_) => ErrorKind::ResourceExhausted(err),
            AllocError::Conflict { .. } | AllocError::Network(NetworkError::InUse(_)) => {
                ErrorKind::ResourceConflict(err)
            }
            AllocError::Network(_) => ErrorKind::InvalidResource(err),
        }
    }
}

impl From<SpawnError> for ErrorKind {
    fn from(err: SpawnError) -> Self {
        ErrorKind::SpawnFailed(err)
    }
}

impl From<TapError> for ErrorKind {
    fn from(err: TapError) -> Self {
        ErrorKind::ExternalTool(err)
    }
}

impl From<TerminateError> for ErrorKind {
    fn from(err: TerminateError) -> Self {
        ErrorKind::Terminate(err)
    }
}

impl From<InvalidTransition> for ErrorKind {
    fn from(err: InvalidTransition) -> Self {
        ErrorKind::InvalidTransition(err)
    }
}

impl From<StateStoreError> for ErrorKind {
    fn from(err: StateStoreError) -> Self {
        match err {
            StateStoreError::NotFound(id) => ErrorKind::NotFound(id),
            other => ErrorKind::StateStore(other),
        }
    }
}

/// Failure of a lifecycle operation.
#[derive(Debug, Error)]
#[error("{phase} failed{}: {kind}", vm_suffix(.vm_id))]
pub struct LifecycleError {
    /// VM the operation concerned, once one was known.
    pub vm_id: Option<VmId>,
    /// Step at which the operation failed.
    pub phase: Phase,
    /// Durable status the VM was left in. `None` means no record exists.
    pub status: Option<VmStatus>,
    /// Whether the VM still holds host resources.
    pub resources_retained: bool,
    #[source]
    pub kind: ErrorKind,
}

fn vm_suffix(vm_id: &Option<VmId>) -> String {
    vm_id.map(|id| format!(" for {id}")).unwrap_or_default()
}

impl LifecycleError {
    pub fn new(phase: Phase, kind: impl Into<ErrorKind>) -> Self {
        Self {
            vm_id: None,
            phase,
            status: None,
            resources_retained: false,
            kind: kind.into(),
        }
    }

    pub fn vm(mut self, vm_id: VmId) -> Self {
        self.vm_id = Some(vm_id);
        self
    }

    /// Record the status the VM was left in.
    pub fn status(mut self, status: VmStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.resources_retained = retained;
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn reason_code(&self) -> &'static str {
        self.kind.reason_code()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound(_))
    }

    pub(crate) fn not_found(vm_id: VmId) -> Self {
        Self::new(Phase::Lookup, ErrorKind::NotFound(vm_id)).vm(vm_id)
    }

    pub(crate) fn artifact(phase: Phase, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::new(
            phase,
            ErrorKind::Artifact {
                path: path.into(),
                source,
            },
        )
    }
}

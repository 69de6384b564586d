//! VM state machine.
//!
//! ```text
//!  creating ──Provisioned──▶ created ──Started──▶ running ──Stopped──▶ stopped
//!      │                        │                    │                    │
//!      └──ProvisionFailed──▶ error ◀──SpawnFailed────┴──Exited(crash)     │
//!                              ▲                                          │
//!                              └──────────── Started / SpawnFailed ◀──────┘
//! ```
//!
//! `Failed` moves any live state to `error`. `Deleted` is terminal and
//! accepted from every settled state.

use std::fmt;

use thiserror::Error;

use crate::state::VmStatus;

/// Something that happened to a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Provisioned,
    ProvisionFailed,
    Started,
    SpawnFailed,
    Stopped,
    Exited { requested: bool },
    Failed,
    Deleted,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioned => f.write_str("provisioned"),
            Self::ProvisionFailed => f.write_str("provision_failed"),
            Self::Started => f.write_str("started"),
            Self::SpawnFailed => f.write_str("spawn_failed"),
            Self::Stopped => f.write_str("stopped"),
            Self::Exited { requested: true } => f.write_str("exited_on_request"),
            Self::Exited { requested: false } => f.write_str("exited_unexpectedly"),
            Self::Failed => f.write_str("failed"),
            Self::Deleted => f.write_str("deleted"),
        }
    }
}

/// Rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot apply {event} to a VM in status {from}")]
pub struct InvalidTransition {
    pub from: VmStatus,
    pub event: LifecycleEvent,
}

/// Next status for `event` applied in `from`.
pub fn transition(from: VmStatus, event: LifecycleEvent) -> Result<VmStatus, InvalidTransition> {
    use LifecycleEvent as E;
    use VmStatus as S;

    let next = match (from, event) {
        (S::Creating, E::Provisioned) => S::Created,
        (S::Creating, E::ProvisionFailed) => S::Error,

        (S::Created | S::Stopped | S::Error, E::Started) => S::Running,
        (S::Created | S::Stopped | S::Error, E::SpawnFailed) => S::Error,

        (S::Running, E::Stopped) => S::Stopped,
        (S::Running, E::Exited { requested: true }) => S::Stopped,
        (S::Running, E::Exited { requested: false }) => S::Error,

        (S::Deleted, _) => return Err(InvalidTransition { from, event }),
        (_, E::Failed) => S::Error,

        (S::Created | S::Stopped | S::Error | S::Running, E::Deleted) => S::Deleted,

        _ => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
}

/// Whether `start` may be attempted from `status`.
pub fn can_start(status: VmStatus) -> bool {
    transition(status, LifecycleEvent::Started).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    use LifecycleEvent as E;
    use VmStatus as S;

    #[rstest]
    #[case(S::Creating, E::Provisioned, S::Created)]
    #[case(S::Creating, E::ProvisionFailed, S::Error)]
    #[case(S::Created, E::Started, S::Running)]
    #[case(S::Stopped, E::Started, S::Running)]
    #[case(S::Error, E::Started, S::Running)]
    #[case(S::Created, E::SpawnFailed, S::Error)]
    #[case(S::Stopped, E::SpawnFailed, S::Error)]
    #[case(S::Running, E::Stopped, S::Stopped)]
    #[case(S::Running, E::Exited { requested: true }, S::Stopped)]
    #[case(S::Running, E::Exited { requested: false }, S::Error)]
    #[case(S::Creating, E::Failed, S::Error)]
    #[case(S::Running, E::Failed, S::Error)]
    #[case(S::Stopped, E::Failed, S::Error)]
    #[case(S::Created, E::Deleted, S::Deleted)]
    #[case(S::Running, E::Deleted, S::Deleted)]
    #[case(S::Stopped, E::Deleted, S::Deleted)]
    #[case(S::Error, E::Deleted, S::Deleted)]
    fn test_allowed_transitions(
        #[case] from: VmStatus,
        #[case] event: LifecycleEvent,
        #[case] to: VmStatus,
    ) {
        assert_eq!(transition(from, event), Ok(to));
    }

    #[rstest]
    #[case(S::Creating, E::Started)]
    #[case(S::Running, E::Started)]
    #[case(S::Running, E::Provisioned)]
    #[case(S::Created, E::Stopped)]
    #[case(S::Stopped, E::Stopped)]
    #[case(S::Created, E::Exited { requested: false })]
    #[case(S::Creating, E::Deleted)]
    #[case(S::Deleted, E::Started)]
    #[case(S::Deleted, E::Failed)]
    #[case(S::Deleted, E::Deleted)]
    fn test_rejected_transitions(#[case] from: VmStatus, #[case] event: LifecycleEvent) {
        let err = transition(from, event).unwrap_err();
        assert_eq!(err.from, from);
        assert_eq!(err.event, event);
    }

    #[test]
    fn test_can_start() {
        assert!(can_start(S::Created));
        assert!(can_start(S::Stopped));
        assert!(can_start(S::Error));
        assert!(!can_start(S::Running));
        assert!(!can_start(S::Creating));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = transition(S::Stopped, E::Stopped).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot apply stopped to a VM in status stopped"
        );
    }
}

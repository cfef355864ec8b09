use crate::ledger::InstallStatus;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Orchestrator state for one installation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Planning,
    AwaitingConsent,
    Executing,
    Completed,
    RollingBack,
    Failed,
}

impl OrchestratorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrchestratorState::Completed | OrchestratorState::Failed)
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorState::Planning => write!(f, "planning"),
            OrchestratorState::AwaitingConsent => write!(f, "awaiting_consent"),
            OrchestratorState::Executing => write!(f, "executing"),
            OrchestratorState::Completed => write!(f, "completed"),
            OrchestratorState::RollingBack => write!(f, "rolling_back"),
            OrchestratorState::Failed => write!(f, "failed"),
        }
    }
}

pub fn validate_transition(from: OrchestratorState, to: OrchestratorState) -> Result<(), CoreError> {
    use OrchestratorState::{AwaitingConsent, Completed, Executing, Failed, Planning, RollingBack};
    let valid = !from.is_terminal()
        && matches!(
            (from, to),
            (Planning, AwaitingConsent)
                | (AwaitingConsent, Executing)
                | (Executing, Completed | RollingBack)
                | (RollingBack, Failed)
        );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Allowed ledger status changes for a single dependency.
///
/// `Completed -> Failed` is the rollback-failure case.
pub fn validate_status_transition(from: InstallStatus, to: InstallStatus) -> Result<(), CoreError> {
    use InstallStatus::{Completed, Failed, Pending, RolledBack, Running, Skipped};
    let valid = matches!(
        (from, to),
        (Pending, Running | Skipped)
            | (Running, Completed | Failed)
            | (Completed, RolledBack | Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

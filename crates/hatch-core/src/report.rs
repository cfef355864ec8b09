use crate::ledger::{DependencyError, InstallStatus, InstallationResult};
use crate::lifecycle::OrchestratorState;
use crate::CoreError;
use hatch_schema::{DependencyKind, PlanFingerprint};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three outcome classes callers must tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    RolledBack,
    /// At least one compensating action failed; manual cleanup required.
    RollbackIncomplete,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded => write!(f, "succeeded"),
            Outcome::RolledBack => write!(f, "failed, rolled back"),
            Outcome::RollbackIncomplete => write!(f, "failed, rollback errors present"),
        }
    }
}

/// The failure that moved the run into rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerError {
    /// `None` when the run was interrupted rather than failed by a dependency.
    pub dependency: Option<String>,
    pub message: String,
}

/// One installed dependency handed to the caller for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub kind: DependencyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationReport {
    pub package: String,
    pub fingerprint: PlanFingerprint,
    pub state: OrchestratorState,
    pub outcome: Outcome,
    pub simulation: bool,
    pub results: Vec<InstallationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerError>,
    /// Empty unless the run completed outside simulation mode.
    #[serde(default)]
    pub manifest: Vec<ManifestEntry>,
}

impl InstallationReport {
    pub(crate) fn new(
        package: String,
        fingerprint: PlanFingerprint,
        simulation: bool,
        results: Vec<InstallationResult>,
        trigger: Option<TriggerError>,
    ) -> Self {
        let rollback_failed = results
            .iter()
            .any(|r| matches!(r.error, Some(DependencyError::Rollback(_))));
        let (state, outcome) = match (&trigger, rollback_failed) {
            (None, _) => (OrchestratorState::Completed, Outcome::Succeeded),
            (Some(_), false) => (OrchestratorState::Failed, Outcome::RolledBack),
            (Some(_), true) => (OrchestratorState::Failed, Outcome::RollbackIncomplete),
        };
        let manifest = if state == OrchestratorState::Completed && !simulation {
            results
                .iter()
                .filter(|r| r.status == InstallStatus::Completed)
                .map(|r| ManifestEntry {
                    name: r.dependency.name.clone(),
                    kind: r.dependency.kind,
                    version: r.installed_version.clone(),
                    location: r.installed_location.clone(),
                })
                .collect()
        } else {
            Vec::new()
        };

        Self {
            package,
            fingerprint,
            state,
            outcome,
            simulation,
            results,
            trigger,
            manifest,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }

    pub fn count(&self, status: InstallStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn result(&self, key: &str) -> Option<&InstallationResult> {
        self.results.iter().find(|r| r.key() == key)
    }

    /// Entries whose compensating action failed.
    pub fn rollback_failures(&self) -> impl Iterator<Item = &InstallationResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.error, Some(DependencyError::Rollback(_))))
    }

    /// Lift a failed run into an error. Rollback failures take precedence
    /// over the triggering install failure.
    pub fn into_result(self) -> Result<Self, CoreError> {
        match self.outcome {
            Outcome::Succeeded => Ok(self),
            Outcome::RollbackIncomplete => Err(CoreError::Rollback {
                keys: self
                    .rollback_failures()
                    .map(|r| r.key().into_inner())
                    .collect(),
            }),
            Outcome::RolledBack => {
                let trigger = self.trigger.unwrap_or_else(|| TriggerError {
                    dependency: None,
                    message: "installation failed".to_owned(),
                });
                Err(CoreError::Installation {
                    key: trigger.dependency.unwrap_or_else(|| "<interrupted>".to_owned()),
                    cause: trigger.message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ExecutionLedger;
    use hatch_installers::Installed;
    use hatch_schema::{Dependency, DependencyKey, InstallationPlan};

    fn ledger() -> ExecutionLedger {
        let plan = InstallationPlan::build(
            "pkg",
            vec![
                Dependency::new(DependencyKind::Runtime, "flask"),
                Dependency::new(DependencyKind::Package, "base").with_resolved_version("1.0.3"),
            ],
        )
        .unwrap();
        ExecutionLedger::from_plan(&plan)
    }

    fn report(ledger: ExecutionLedger, trigger: Option<TriggerError>, simulation: bool) -> InstallationReport {
        InstallationReport::new(
            "pkg".to_owned(),
            PlanFingerprint::new("fp"),
            simulation,
            ledger.into_entries(),
            trigger,
        )
    }

    fn complete(ledger: &mut ExecutionLedger, key: &str) {
        let key = DependencyKey::new(key);
        ledger.mark_running(&key).unwrap();
        ledger
            .mark_completed(&key, Installed::new(Some("1.0".to_owned()), Some("/x".to_owned())))
            .unwrap();
    }

    fn trigger() -> Option<TriggerError> {
        Some(TriggerError {
            dependency: Some("package:base".to_owned()),
            message: "boom".to_owned(),
        })
    }

    #[test]
    fn success_carries_manifest() {
        let mut l = ledger();
        complete(&mut l, "runtime:flask");
        complete(&mut l, "package:base");
        let r = report(l, None, false);
        assert!(r.is_success());
        assert_eq!(r.state, OrchestratorState::Completed);
        assert_eq!(r.manifest.len(), 2);
        assert_eq!(r.manifest[0].version.as_deref(), Some("1.0"));
        assert!(r.into_result().is_ok());
    }

    #[test]
    fn simulation_has_no_manifest() {
        let mut l = ledger();
        complete(&mut l, "runtime:flask");
        let r = report(l, None, true);
        assert!(r.is_success());
        assert!(r.manifest.is_empty());
    }

    #[test]
    fn clean_rollback_maps_to_installation_error() {
        let mut l = ledger();
        complete(&mut l, "runtime:flask");
        l.mark_rolled_back(&DependencyKey::new("runtime:flask")).unwrap();
        let r = report(l, trigger(), false);
        assert_eq!(r.outcome, Outcome::RolledBack);
        assert!(r.manifest.is_empty());
        match r.into_result() {
            Err(CoreError::Installation { key, cause }) => {
                assert_eq!(key, "package:base");
                assert_eq!(cause, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rollback_errors_take_precedence() {
        let mut l = ledger();
        complete(&mut l, "runtime:flask");
        l.mark_rollback_failed(&DependencyKey::new("runtime:flask"), "stuck".to_owned())
            .unwrap();
        let r = report(l, trigger(), false);
        assert_eq!(r.outcome, Outcome::RollbackIncomplete);
        assert_eq!(r.rollback_failures().count(), 1);
        assert!(matches!(
            r.into_result(),
            Err(CoreError::Rollback { keys }) if keys == vec!["runtime:flask".to_owned()]
        ));
    }
}

use crate::lifecycle::validate_status_transition;
use crate::CoreError;
use hatch_installers::Installed;
use hatch_schema::{Dependency, DependencyKey, InstallationPlan};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    RolledBack,
}

impl fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallStatus::Pending => write!(f, "pending"),
            InstallStatus::Running => write!(f, "running"),
            InstallStatus::Completed => write!(f, "completed"),
            InstallStatus::Failed => write!(f, "failed"),
            InstallStatus::Skipped => write!(f, "skipped"),
            InstallStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadySatisfied,
    /// An earlier failure stopped the run before this dependency started.
    Halted,
}

/// Error attached to a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "message", rename_all = "snake_case")]
pub enum DependencyError {
    Install(String),
    Rollback(String),
}

impl DependencyError {
    pub fn message(&self) -> &str {
        match self {
            DependencyError::Install(m) | DependencyError::Rollback(m) => m,
        }
    }
}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyError::Install(m) => write!(f, "install failed: {m}"),
            DependencyError::Rollback(m) => write!(f, "rollback failed: {m}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationResult {
    pub dependency: Dependency,
    pub status: InstallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DependencyError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Order in which completion was recorded; drives rollback order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_sequence: Option<u64>,
}

impl InstallationResult {
    fn pending(dependency: Dependency) -> Self {
        Self {
            dependency,
            status: InstallStatus::Pending,
            installed_version: None,
            installed_location: None,
            error: None,
            skip_reason: None,
            completed_at_sequence: None,
        }
    }

    pub fn key(&self) -> DependencyKey {
        self.dependency.key()
    }
}

/// Per-request record of every dependency's outcome.
///
/// Only the orchestrator thread mutates a ledger; workers report to it
/// over a channel.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLedger {
    entries: Vec<InstallationResult>,
    index: HashMap<DependencyKey, usize>,
    completions: u64,
}

impl ExecutionLedger {
    /// One pending entry per planned dependency, in stage order.
    pub fn from_plan(plan: &InstallationPlan) -> Self {
        let entries: Vec<InstallationResult> = plan
            .dependencies()
            .cloned()
            .map(InstallationResult::pending)
            .collect();
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key(), i))
            .collect();
        Self {
            entries,
            index,
            completions: 0,
        }
    }

    pub fn entries(&self) -> &[InstallationResult] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<InstallationResult> {
        self.entries
    }

    pub fn get(&self, key: &DependencyKey) -> Option<&InstallationResult> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    pub fn count(&self, status: InstallStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    fn transition(
        &mut self,
        key: &DependencyKey,
        to: InstallStatus,
    ) -> Result<&mut InstallationResult, CoreError> {
        let i = *self
            .index
            .get(key)
            .ok_or_else(|| CoreError::UnknownDependency(key.to_string()))?;
        let entry = &mut self.entries[i];
        validate_status_transition(entry.status, to)?;
        entry.status = to;
        Ok(entry)
    }

    pub(crate) fn mark_running(&mut self, key: &DependencyKey) -> Result<(), CoreError> {
        self.transition(key, InstallStatus::Running).map(|_| ())
    }

    /// Record completion and return its sequence number.
    pub(crate) fn mark_completed(
        &mut self,
        key: &DependencyKey,
        installed: Installed,
    ) -> Result<u64, CoreError> {
        let sequence = self.completions + 1;
        let entry = self.transition(key, InstallStatus::Completed)?;
        entry.installed_version = installed.version;
        entry.installed_location = installed.location;
        entry.completed_at_sequence = Some(sequence);
        self.completions = sequence;
        Ok(sequence)
    }

    pub(crate) fn mark_failed(&mut self, key: &DependencyKey, error: String) -> Result<(), CoreError> {
        let entry = self.transition(key, InstallStatus::Failed)?;
        entry.error = Some(DependencyError::Install(error));
        Ok(())
    }

    pub(crate) fn mark_skipped(
        &mut self,
        key: &DependencyKey,
        reason: SkipReason,
    ) -> Result<(), CoreError> {
        let entry = self.transition(key, InstallStatus::Skipped)?;
        entry.skip_reason = Some(reason);
        Ok(())
    }

    /// Skip every dependency that never started. Returns how many changed.
    pub(crate) fn skip_pending(&mut self) -> usize {
        let mut skipped = 0;
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.status == InstallStatus::Pending)
        {
            entry.status = InstallStatus::Skipped;
            entry.skip_reason = Some(SkipReason::Halted);
            skipped += 1;
        }
        skipped
    }

    pub(crate) fn mark_rolled_back(&mut self, key: &DependencyKey) -> Result<(), CoreError> {
        self.transition(key, InstallStatus::RolledBack).map(|_| ())
    }

    pub(crate) fn mark_rollback_failed(
        &mut self,
        key: &DependencyKey,
        error: String,
    ) -> Result<(), CoreError> {
        let entry = self.transition(key, InstallStatus::Failed)?;
        entry.error = Some(DependencyError::Rollback(error));
        Ok(())
    }

    /// Completed entries, most recently completed first.
    pub fn completed_in_reverse(&self) -> Vec<&InstallationResult> {
        let mut done: Vec<&InstallationResult> = self
            .entries
            .iter()
            .filter(|e| e.status == InstallStatus::Completed)
            .collect();
        done.sort_by_key(|e| std::cmp::Reverse(e.completed_at_sequence));
        done
    }
}

use crate::types::DependencyKey;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Started,
    Progress,
    Completed,
    Failed,
}

impl fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressPhase::Started => write!(f, "started"),
            ProgressPhase::Progress => write!(f, "progress"),
            ProgressPhase::Completed => write!(f, "completed"),
            ProgressPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Immutable lifecycle event for one dependency.
///
/// `sequence` comes from a single counter per installation request, so
/// observers can restore a total order across concurrent installs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub dependency_key: DependencyKey,
    pub phase: ProgressPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    pub message: String,
    pub sequence: u64,
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.sequence, self.dependency_key, self.phase)?;
        if let Some(p) = self.percent {
            write!(f, " {p}%")?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_sequence_phase_and_percent() {
        let ev = ProgressEvent {
            dependency_key: DependencyKey::new("runtime:numpy"),
            phase: ProgressPhase::Progress,
            percent: Some(40),
            message: "downloading".to_owned(),
            sequence: 7,
        };
        assert_eq!(ev.to_string(), "[7] runtime:numpy progress 40%: downloading");
    }

    #[test]
    fn phase_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ProgressPhase::Completed).unwrap(),
            "\"completed\""
        );
    }
}

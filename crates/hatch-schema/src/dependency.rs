use crate::types::DependencyKey;
use crate::PlanError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The four dependency kinds, declared in stage execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    System,
    Runtime,
    Package,
    Container,
}

impl DependencyKind {
    /// Fixed stage order: system, runtime, package, container.
    pub const STAGE_ORDER: [DependencyKind; 4] = [
        DependencyKind::System,
        DependencyKind::Runtime,
        DependencyKind::Package,
        DependencyKind::Container,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DependencyKind::System => "system",
            DependencyKind::Runtime => "runtime",
            DependencyKind::Package => "package",
            DependencyKind::Container => "container",
        }
    }

    /// Position of this kind's stage in [`Self::STAGE_ORDER`].
    pub fn stage_index(self) -> usize {
        match self {
            DependencyKind::System => 0,
            DependencyKind::Runtime => 1,
            DependencyKind::Package => 2,
            DependencyKind::Container => 3,
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyKind {
    type Err = PlanError;

    /// Accepts the canonical names plus the declaration-file aliases
    /// (`python`, `hatch`, `docker`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(DependencyKind::System),
            "runtime" | "python" => Ok(DependencyKind::Runtime),
            "package" | "hatch" => Ok(DependencyKind::Package),
            "container" | "docker" => Ok(DependencyKind::Container),
            _ => Err(PlanError::UnknownKind(s.to_owned())),
        }
    }
}

/// One requirement to satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub kind: DependencyKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_constraint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_version: Option<String>,
    /// Which package manager, registry, or source the backend should use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_hint: Option<String>,
    /// Name of an intra-stage predecessor that must finish first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl Dependency {
    pub fn new(kind: DependencyKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            version_constraint: None,
            resolved_version: None,
            backend_hint: None,
            after: None,
        }
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.version_constraint = Some(constraint.into());
        self
    }

    #[must_use]
    pub fn with_resolved_version(mut self, version: impl Into<String>) -> Self {
        self.resolved_version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_backend_hint(mut self, hint: impl Into<String>) -> Self {
        self.backend_hint = Some(hint.into());
        self
    }

    #[must_use]
    pub fn with_after(mut self, predecessor: impl Into<String>) -> Self {
        self.after = Some(predecessor.into());
        self
    }

    pub fn key(&self) -> DependencyKey {
        DependencyKey::new(format!("{}:{}", self.kind, self.name))
    }

    /// Name joined with its version constraint, e.g. `requests>=2.28.0`.
    pub fn requirement(&self) -> String {
        match &self.version_constraint {
            Some(c) if !c.trim().is_empty() => format!("{}{}", self.name, c.trim()),
            _ => self.name.clone(),
        }
    }

    /// Exact version pinned by the constraint (`==1.2.3` or `=1.2.3`), if any.
    pub fn pinned_version(&self) -> Option<&str> {
        let c = self.version_constraint.as_deref()?.trim();
        let rest = c.strip_prefix("==").or_else(|| c.strip_prefix('='))?;
        let rest = rest.trim();
        if rest.is_empty() || rest.contains(['<', '>', ',', '*', '~', '^']) {
            None
        } else {
            Some(rest)
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.requirement())?;
        if let Some(v) = &self.resolved_version {
            write!(f, " (resolved {v})")?;
        }
        Ok(())
    }
}

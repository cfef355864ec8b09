//! Dependency model, package declarations, and installation plans for Hatch.
//!
//! This crate defines the data layer: the four dependency kinds and their
//! fixed stage order (`DependencyKind`), resolved `Dependency` values,
//! `hatch_metadata.json` parsing (`PackageDeclaration`), the immutable
//! `InstallationPlan` with its fingerprint, and `ProgressEvent` values.

pub mod declaration;
pub mod dependency;
pub mod plan;
pub mod progress;
pub mod types;

pub use declaration::{
    parse_declaration_file, parse_declaration_str, DeclarationError, DeclaredDependency,
    PackageDeclaration, DECLARATION_FILE,
};
pub use dependency::{Dependency, DependencyKind};
pub use plan::{InstallationPlan, Stage};
pub use progress::{ProgressEvent, ProgressPhase};
pub use types::{DependencyKey, PlanFingerprint};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("unrecognized dependency kind: '{0}'")]
    UnknownKind(String),
    #[error("invalid dependency section '{section}': {reason}")]
    InvalidSection { section: String, reason: String },
    #[error("{0} dependency with empty name")]
    EmptyName(DependencyKind),
    #[error("invalid {kind} dependency name '{name}': {reason}")]
    InvalidName {
        kind: DependencyKind,
        name: String,
        reason: &'static str,
    },
    #[error("package dependency '{0}' has no resolved version")]
    MissingResolvedVersion(String),
    #[error("dependency '{0}' declared more than once")]
    Duplicate(String),
    #[error("dependency '{dependency}' must run after '{predecessor}', which is not in the same stage")]
    DanglingPredecessor {
        dependency: String,
        predecessor: String,
    },
    #[error("predecessor chain of '{0}' forms a cycle")]
    PredecessorCycle(String),
    #[error("plan serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

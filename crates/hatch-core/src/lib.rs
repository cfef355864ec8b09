//! Dependency installation orchestrator for Hatch.
//!
//! This crate ties together plan construction, installer dispatch, and the
//! progress bus into the `Orchestrator`: it drives an installation request
//! through `Planning -> AwaitingConsent -> Executing -> Completed`, or on
//! failure through `RollingBack -> Failed`, recording every dependency in an
//! `ExecutionLedger` and unwinding completed work in reverse completion
//! order. It also provides the consent gate, resolver and environment-store
//! interfaces with default implementations, configuration loading, and
//! process-level concurrency helpers.

pub mod concurrency;
pub mod config;
pub mod consent;
pub mod environment;
pub mod ledger;
pub mod lifecycle;
pub mod orchestrator;
pub mod report;
pub mod resolver;
mod rollback;

pub use concurrency::{install_signal_handler, shutdown_requested, StoreLock};
pub use config::{hatch_home, HatchConfig, BACKEND_ENV, HOME_ENV};
pub use consent::{
    decide, env_truthy, ApprovalReason, ConsentDecision, ConsentFlags, ConsentGate,
    ConsentPrompt, LinePrompt, AUTO_APPROVE_ENV,
};
pub use environment::{validate_env_name, EnvironmentStore, InstalledRecord, JsonEnvironmentStore};
pub use ledger::{DependencyError, ExecutionLedger, InstallStatus, InstallationResult, SkipReason};
pub use lifecycle::{validate_status_transition, validate_transition, OrchestratorState};
pub use orchestrator::{InstallOptions, InterruptCheck, Orchestrator};
pub use report::{InstallationReport, ManifestEntry, Outcome, TriggerError};
pub use resolver::{DeclarationResolver, ResolveError, Resolver};

use hatch_installers::InstallerError;
use hatch_schema::{DeclarationError, DependencyKind, PlanError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("declaration error: {0}")]
    Declaration(#[from] DeclarationError),
    #[error("plan construction failed: {0}")]
    Plan(#[from] PlanError),
    #[error("dependency resolution failed: {0}")]
    Resolve(ResolveError),
    #[error("installation not approved: {0}")]
    ConsentDenied(String),
    #[error("no installer registered for '{0}' dependencies")]
    InstallerNotFound(DependencyKind),
    #[error("installer error: {0}")]
    Installer(InstallerError),
    #[error("plan fingerprint mismatch: expected {expected}, planned {actual}")]
    PlanMismatch { expected: String, actual: String },
    #[error("installation of {key} failed: {cause}")]
    Installation { key: String, cause: String },
    #[error("rollback incomplete, manual cleanup required for: {}", .keys.join(", "))]
    Rollback { keys: Vec<String> },
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("unknown dependency in ledger: {0}")]
    UnknownDependency(String),
    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),
    #[error("invalid environment name: {0}")]
    InvalidEnvironmentName(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("store lock: {0}")]
    Lock(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ResolveError> for CoreError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Plan(p) => CoreError::Plan(p),
            other => CoreError::Resolve(other),
        }
    }
}

impl From<InstallerError> for CoreError {
    fn from(e: InstallerError) -> Self {
        match e {
            InstallerError::NotFound(kind) => CoreError::InstallerNotFound(kind),
            other => CoreError::Installer(other),
        }
    }
}

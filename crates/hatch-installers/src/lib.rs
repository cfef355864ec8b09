//! Installer capability, registry, and backends for Hatch.
//!
//! This crate implements the execution layer: the `Installer` trait every
//! dependency backend satisfies, the shared `InstallContext` (progress
//! emitter, cooperative cancellation, simulation flag, deadline), the
//! write-once `InstallerRegistry`, the `ProgressBus`, and concrete
//! backends for pip, apt, docker and local hatch packages plus a
//! scriptable mock.

pub mod apt;
pub mod command;
pub mod docker;
pub mod installer;
pub mod mock;
pub mod package;
pub mod pip;
pub mod progress;
pub mod registry;

pub use command::{check_backend_prereqs, format_missing, version_satisfies, MissingPrereq};
pub use installer::{BackendConfig, CancellationToken, InstallContext, Installed, Installer};
pub use mock::{MockCall, MockInstaller, MockOp, MockScript};
pub use package::PackageSource;
pub use progress::{
    ProgressBus, ProgressEmitter, ProgressObserver, SequenceCounter, SubscriptionHandle,
};
pub use registry::{select_backends, InstallerRegistry};

use hatch_schema::DependencyKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("installer I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("an installer for '{0}' dependencies is already registered")]
    DuplicateRegistration(DependencyKind),
    #[error("no installer registered for '{0}' dependencies")]
    NotFound(DependencyKind),
    #[error("backend '{0}' is not available")]
    BackendUnavailable(String),
    #[error("installer '{installer}' cannot handle {dependency}")]
    Unsupported {
        installer: String,
        dependency: String,
    },
    #[error("required tool not found: {0}")]
    ToolMissing(String),
    #[error("command '{command}' failed (exit {}): {stderr}", exit_label(.code))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("dependency name '{0}' is not a plain directory name")]
    UnsafeName(String),
    #[error("{name} {version} is not available")]
    VersionUnavailable { name: String, version: String },
    #[error("installation cancelled")]
    Cancelled,
    #[error("timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),
    #[error("{0}")]
    Failed(String),
}

#[allow(clippy::ref_option)]
fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_owned(), |c| c.to_string())
}

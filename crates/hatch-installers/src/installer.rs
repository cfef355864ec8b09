use crate::progress::ProgressEmitter;
use crate::InstallerError;
use hatch_schema::{Dependency, DependencyKey, ProgressPhase};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a successful `install` reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installed {
    pub version: Option<String>,
    pub location: Option<String>,
}

impl Installed {
    pub fn new(version: Option<String>, location: Option<String>) -> Self {
        Self { version, location }
    }
}

/// Cooperative cancellation flag shared between the orchestrator and the
/// installers of one stage.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared context handed to every installer call.
#[derive(Clone)]
pub struct InstallContext {
    emitter: ProgressEmitter,
    cancel: CancellationToken,
    simulation: bool,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl InstallContext {
    pub fn new(emitter: ProgressEmitter, cancel: CancellationToken) -> Self {
        Self {
            emitter,
            cancel,
            simulation: false,
            timeout: None,
            deadline: None,
        }
    }

    /// Context for one-off calls outside an orchestrated run.
    pub fn detached(key: DependencyKey) -> Self {
        Self::new(ProgressEmitter::detached(key), CancellationToken::new())
    }

    #[must_use]
    pub fn with_simulation(mut self, simulation: bool) -> Self {
        self.simulation = simulation;
        self
    }

    /// Start the per-dependency clock now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    pub fn emitter(&self) -> &ProgressEmitter {
        &self.emitter
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// When set, installers validate and emit events but mutate nothing.
    pub fn simulation(&self) -> bool {
        self.simulation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with `Cancelled` or `TimedOut` when the installer should stop.
    pub fn check(&self) -> Result<(), InstallerError> {
        if self.cancel.is_cancelled() {
            return Err(InstallerError::Cancelled);
        }
        if let (Some(deadline), Some(timeout)) = (self.deadline, self.timeout) {
            if Instant::now() >= deadline {
                return Err(InstallerError::TimedOut(timeout));
            }
        }
        Ok(())
    }

    pub fn progress(&self, percent: Option<u8>, message: impl Into<String>) {
        self.emitter.emit(ProgressPhase::Progress, percent, message);
    }
}

/// Capability every dependency backend implements.
///
/// Implementations are shared across threads for the lifetime of the
/// process; per-call state lives in the [`InstallContext`].
pub trait Installer: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, dependency: &Dependency) -> bool;

    /// Whether the dependency is already present. Must not mutate anything.
    fn is_already_satisfied(
        &self,
        dependency: &Dependency,
        ctx: &InstallContext,
    ) -> Result<bool, InstallerError>;

    fn install(
        &self,
        dependency: &Dependency,
        ctx: &InstallContext,
    ) -> Result<Installed, InstallerError>;

    /// Compensating action. Must tolerate a partially failed install and
    /// succeed when there is nothing to undo.
    fn uninstall(&self, dependency: &Dependency, ctx: &InstallContext)
        -> Result<(), InstallerError>;

    /// Called for each dependency this installer completed, once the whole
    /// request has succeeded. Drops anything kept only so `uninstall` could
    /// restore what was there before.
    fn commit(&self, _dependency: &Dependency, _ctx: &InstallContext) -> Result<(), InstallerError> {
        Ok(())
    }
}

/// Paths and executable names used by the concrete backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub python: String,
    pub apt_get: String,
    pub dpkg_query: String,
    pub docker: String,
    /// Directory holding hatch packages as `<name>/<version>/` or `<name>/`.
    pub package_source: Option<PathBuf>,
    /// Environment directory hatch packages are copied into.
    pub environment_dir: PathBuf,
}

impl BackendConfig {
    pub fn new(environment_dir: impl Into<PathBuf>) -> Self {
        Self {
            python: "python3".to_owned(),
            apt_get: "apt-get".to_owned(),
            dpkg_query: "dpkg-query".to_owned(),
            docker: "docker".to_owned(),
            package_source: None,
            environment_dir: environment_dir.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_reports_cancellation() {
        let ctx = InstallContext::detached(DependencyKey::new("runtime:x"));
        assert!(ctx.check().is_ok());
        ctx.cancellation().cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.check(), Err(InstallerError::Cancelled)));
    }

    #[test]
    fn check_reports_timeout() {
        let ctx = InstallContext::detached(DependencyKey::new("runtime:x"))
            .with_timeout(Some(Duration::from_millis(0)));
        assert!(matches!(ctx.check(), Err(InstallerError::TimedOut(_))));
    }

    #[test]
    fn cancellation_token_clones_share_state() {
        let a = CancellationToken::new();
        let b = a.clone();
        b.cancel();
        assert!(a.is_cancelled());
    }

    #[test]
    fn simulation_flag_defaults_off() {
        let ctx = InstallContext::detached(DependencyKey::new("runtime:x"));
        assert!(!ctx.simulation());
        assert!(ctx.with_simulation(true).simulation());
    }

    #[test]
    fn backend_config_defaults() {
        let cfg = BackendConfig::new("/tmp/env");
        assert_eq!(cfg.python, "python3");
        assert_eq!(cfg.docker, "docker");
        assert!(cfg.package_source.is_none());
    }
}

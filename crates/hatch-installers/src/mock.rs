use crate::installer::{InstallContext, Installed, Installer};
use crate::InstallerError;
use hatch_schema::{Dependency, DependencyKey};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const SLICE: Duration = Duration::from_millis(5);

/// Scripted behaviour for one dependency name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockScript {
    pub fail_install: bool,
    pub fail_uninstall: bool,
    pub satisfied: bool,
    pub delay: Duration,
    pub ignore_cancel: bool,
}

impl MockScript {
    /// Parse a `mock:` backend hint, e.g. `mock:fail`, `mock:fail-uninstall`,
    /// `mock:satisfied`, `mock:delay=200`, combinable with `+`.
    pub fn from_hint(hint: &str) -> Option<Self> {
        let body = hint.strip_prefix("mock:")?;
        let mut script = Self::default();
        for token in body.split('+').map(str::trim) {
            match token {
                "fail" => script.fail_install = true,
                "fail-uninstall" => script.fail_uninstall = true,
                "satisfied" => script.satisfied = true,
                "stubborn" => script.ignore_cancel = true,
                t => {
                    if let Some(ms) = t.strip_prefix("delay=").and_then(|v| v.parse().ok()) {
                        script.delay = Duration::from_millis(ms);
                    }
                }
            }
        }
        Some(script)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    CheckSatisfied,
    InstallBegin,
    InstallEnd,
    Uninstall,
    Commit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub key: DependencyKey,
    pub simulation: bool,
}

/// In-memory installer for tests and dry runs of the CLI.
///
/// Behaviour is taken from scripts registered by name, falling back to a
/// `mock:` backend hint on the dependency, then to plain success. Every
/// call is appended to a journal in call order.
#[derive(Default)]
pub struct MockInstaller {
    scripts: Mutex<HashMap<String, MockScript>>,
    journal: Mutex<Vec<MockCall>>,
    installed: Mutex<HashSet<DependencyKey>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    fn script_mut(&self, name: &str, f: impl FnOnce(&mut MockScript)) {
        if let Ok(mut scripts) = self.scripts.lock() {
            f(scripts.entry(name.to_owned()).or_default());
        }
    }

    #[must_use]
    pub fn fail_install(self, name: &str) -> Self {
        self.script_mut(name, |s| s.fail_install = true);
        self
    }

    #[must_use]
    pub fn fail_uninstall(self, name: &str) -> Self {
        self.script_mut(name, |s| s.fail_uninstall = true);
        self
    }

    #[must_use]
    pub fn satisfied(self, name: &str) -> Self {
        self.script_mut(name, |s| s.satisfied = true);
        self
    }

    #[must_use]
    pub fn delay(self, name: &str, delay: Duration) -> Self {
        self.script_mut(name, |s| s.delay = delay);
        self
    }

    /// Keep running after cancellation is signalled.
    #[must_use]
    pub fn ignore_cancel(self, name: &str) -> Self {
        self.script_mut(name, |s| s.ignore_cancel = true);
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    fn keys_for(&self, op: MockOp) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == op)
            .map(|c| c.key.into_inner())
            .collect()
    }

    /// Keys whose install was entered, in call order.
    pub fn installs(&self) -> Vec<String> {
        self.keys_for(MockOp::InstallBegin)
    }

    pub fn uninstalls(&self) -> Vec<String> {
        self.keys_for(MockOp::Uninstall)
    }

    pub fn commits(&self) -> Vec<String> {
        self.keys_for(MockOp::Commit)
    }

    pub fn is_installed(&self, key: &str) -> bool {
        self.installed
            .lock()
            .map(|i| i.contains(&DependencyKey::new(key)))
            .unwrap_or(false)
    }

    /// Highest number of installs observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn script_for(&self, dependency: &Dependency) -> MockScript {
        let scripted = self
            .scripts
            .lock()
            .ok()
            .and_then(|s| s.get(&dependency.name).cloned());
        scripted
            .or_else(|| dependency.backend_hint.as_deref().and_then(MockScript::from_hint))
            .unwrap_or_default()
    }

    fn record(&self, op: MockOp, dependency: &Dependency, ctx: &InstallContext) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(MockCall {
                op,
                key: dependency.key(),
                simulation: ctx.simulation(),
            });
        }
    }

    fn wait(script: &MockScript, ctx: &InstallContext) -> Result<(), InstallerError> {
        let mut remaining = script.delay;
        while !remaining.is_zero() {
            if !script.ignore_cancel {
                ctx.check()?;
            }
            let step = remaining.min(SLICE);
            std::thread::sleep(step);
            remaining -= step;
        }
        Ok(())
    }
}

impl Installer for MockInstaller {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn can_handle(&self, _dependency: &Dependency) -> bool {
        true
    }

    fn is_already_satisfied(
        &self,
        dependency: &Dependency,
        ctx: &InstallContext,
    ) -> Result<bool, InstallerError> {
        self.record(MockOp::CheckSatisfied, dependency, ctx);
        Ok(self.script_for(dependency).satisfied || self.is_installed(&dependency.key()))
    }

    fn install(
        &self,
        dependency: &Dependency,
        ctx: &InstallContext,
    ) -> Result<Installed, InstallerError> {
        let script = self.script_for(dependency);
        self.record(MockOp::InstallBegin, dependency, ctx);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        ctx.progress(Some(50), format!("mock installing {}", dependency.requirement()));
        let outcome = Self::wait(&script, ctx).and_then(|()| {
            if script.fail_install {
                Err(InstallerError::Failed(format!(
                    "mock install of {} failed",
                    dependency.name
                )))
            } else {
                Ok(())
            }
        });

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.record(MockOp::InstallEnd, dependency, ctx);
        outcome?;

        if !ctx.simulation() {
            if let Ok(mut installed) = self.installed.lock() {
                installed.insert(dependency.key());
            }
        }
        let version = dependency
            .resolved_version
            .clone()
            .or_else(|| dependency.pinned_version().map(str::to_owned))
            .unwrap_or_else(|| "0.0.0-mock".to_owned());
        Ok(Installed::new(
            Some(version),
            Some(format!("mock://{}", dependency.key())),
        ))
    }

    fn uninstall(
        &self,
        dependency: &Dependency,
        ctx: &InstallContext,
    ) -> Result<(), InstallerError> {
        self.record(MockOp::Uninstall, dependency, ctx);
        if self.script_for(dependency).fail_uninstall {
            return Err(InstallerError::Failed(format!(
                "mock uninstall of {} failed",
                dependency.name
            )));
        }
        if let Ok(mut installed) = self.installed.lock() {
            installed.remove(&dependency.key());
        }
        Ok(())
    }

    fn commit(&self, dependency: &Dependency, ctx: &InstallContext) -> Result<(), InstallerError> {
        self.record(MockOp::Commit, dependency, ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatch_schema::DependencyKind;

    fn dep(name: &str) -> Dependency {
        Dependency::new(DependencyKind::Runtime, name)
    }

    #[test]
    fn mock_lifecycle() {
        let mock = MockInstaller::new();
        let d = dep("flask");
        let ctx = InstallContext::detached(d.key());

        assert!(!mock.is_already_satisfied(&d, &ctx).unwrap());
        let installed = mock.install(&d, &ctx).unwrap();
        assert_eq!(installed.version.as_deref(), Some("0.0.0-mock"));
        assert!(mock.is_installed("runtime:flask"));
        assert!(mock.is_already_satisfied(&d, &ctx).unwrap());

        mock.uninstall(&d, &ctx).unwrap();
        assert!(!mock.is_installed("runtime:flask"));
        assert_eq!(mock.installs(), vec!["runtime:flask"]);
        assert_eq!(mock.uninstalls(), vec!["runtime:flask"]);
    }

    #[test]
    fn scripted_failures() {
        let mock = MockInstaller::new().fail_install("bad").fail_uninstall("sticky");
        let bad = dep("bad");
        assert!(mock.install(&bad, &InstallContext::detached(bad.key())).is_err());
        let sticky = dep("sticky");
        let ctx = InstallContext::detached(sticky.key());
        mock.install(&sticky, &ctx).unwrap();
        assert!(mock.uninstall(&sticky, &ctx).is_err());
    }

    #[test]
    fn hint_scripts_apply_without_registration() {
        let mock = MockInstaller::new();
        let d = dep("x").with_backend_hint("mock:fail+delay=10");
        let start = std::time::Instant::now();
        assert!(mock.install(&d, &InstallContext::detached(d.key())).is_err());
        assert!(start.elapsed() >= Duration::from_millis(10));

        let s = dep("y").with_backend_hint("mock:satisfied");
        assert!(mock
            .is_already_satisfied(&s, &InstallContext::detached(s.key()))
            .unwrap());
    }

    #[test]
    fn parse_hint_tokens() {
        let script = MockScript::from_hint("mock:fail-uninstall+stubborn+delay=250").unwrap();
        assert!(script.fail_uninstall);
        assert!(script.ignore_cancel);
        assert!(!script.fail_install);
        assert_eq!(script.delay, Duration::from_millis(250));
        assert!(MockScript::from_hint("pip").is_none());
    }

    #[test]
    fn cancellation_interrupts_delay() {
        let mock = MockInstaller::new().delay("slow", Duration::from_secs(5));
        let d = dep("slow");
        let ctx = InstallContext::detached(d.key());
        ctx.cancellation().cancel();
        let err = mock.install(&d, &ctx).unwrap_err();
        assert!(matches!(err, InstallerError::Cancelled));
        assert!(!mock.is_installed("runtime:slow"));
    }

    #[test]
    fn stubborn_install_ignores_cancellation() {
        let mock = MockInstaller::new()
            .delay("stubborn", Duration::from_millis(20))
            .ignore_cancel("stubborn");
        let d = dep("stubborn");
        let ctx = InstallContext::detached(d.key());
        ctx.cancellation().cancel();
        assert!(mock.install(&d, &ctx).is_ok());
    }

    #[test]
    fn simulation_leaves_no_state() {
        let mock = MockInstaller::new();
        let d = dep("flask");
        let ctx = InstallContext::detached(d.key()).with_simulation(true);
        mock.install(&d, &ctx).unwrap();
        assert!(!mock.is_installed("runtime:flask"));
        assert!(mock.calls().iter().all(|c| c.simulation));
    }
}

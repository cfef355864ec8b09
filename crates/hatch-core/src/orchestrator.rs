//! Staged, parallel execution of an [`InstallationPlan`].
//!
//! Stages run strictly in order. Inside a stage, ready dependencies are
//! pulled from a shared frontier by a bounded set of scoped worker threads;
//! a dependency becomes ready once its `after` predecessor is done.
//! Workers never touch the ledger: they report over a channel and the
//! orchestrator thread records every transition, so completion sequence
//! numbers are assigned in a single place.

use crate::concurrency::shutdown_requested;
use crate::consent::{ConsentFlags, ConsentGate};
use crate::ledger::{ExecutionLedger, SkipReason};
use crate::lifecycle::{validate_transition, OrchestratorState};
use crate::report::{InstallationReport, TriggerError};
use crate::resolver::Resolver;
use crate::rollback;
use crate::CoreError;
use hatch_installers::{
    CancellationToken, InstallContext, Installed, Installer, InstallerError, InstallerRegistry,
    ProgressBus, ProgressEmitter, ProgressObserver, SequenceCounter,
};
use hatch_schema::{
    Dependency, DependencyKey, DependencyKind, InstallationPlan, PackageDeclaration,
    PlanFingerprint, ProgressEvent, ProgressPhase, Stage,
};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub(crate) type InstallerMap = HashMap<DependencyKind, Arc<dyn Installer>>;

/// Polled while executing; `true` cancels the run and rolls it back.
pub type InterruptCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Per-request options for [`Orchestrator::run_installation`].
#[derive(Default)]
pub struct InstallOptions {
    pub auto_approve: bool,
    pub refuse: bool,
    /// Installers validate and report but change nothing.
    pub simulation: bool,
    /// Worker limit per stage. `None` runs every ready dependency of a stage
    /// at once; `Some(1)` gives a deterministic run.
    pub concurrency: Option<usize>,
    /// Per-dependency deadline, surfaced as an ordinary failure.
    pub timeout: Option<Duration>,
    /// Refuse to execute a plan whose fingerprint differs.
    pub expected_fingerprint: Option<PlanFingerprint>,
    /// Attached to the progress bus before the first stage starts.
    pub observers: Vec<Box<dyn ProgressObserver>>,
}

impl InstallOptions {
    #[must_use]
    pub fn with_observer(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    fn consent_flags(&self) -> ConsentFlags {
        ConsentFlags {
            auto_approve: self.auto_approve,
            refuse: self.refuse,
        }
    }
}

pub struct Orchestrator {
    registry: InstallerRegistry,
    resolver: Box<dyn Resolver>,
    consent: ConsentGate,
    interrupted: InterruptCheck,
}

impl Orchestrator {
    pub fn new(registry: InstallerRegistry, resolver: impl Resolver + 'static) -> Self {
        Self {
            registry,
            resolver: Box::new(resolver),
            consent: ConsentGate::stdio(),
            interrupted: Arc::new(shutdown_requested),
        }
    }

    /// Replace the Ctrl-C flag as the source of interrupts.
    #[must_use]
    pub fn with_interrupt(mut self, interrupted: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.interrupted = Arc::new(interrupted);
        self
    }

    #[must_use]
    pub fn with_consent(mut self, consent: ConsentGate) -> Self {
        self.consent = consent;
        self
    }

    pub fn registry(&self) -> &InstallerRegistry {
        &self.registry
    }

    /// Resolve and bucket a declaration. This is the exact plan
    /// [`run_installation`](Self::run_installation) executes for the same
    /// input, so it doubles as the dry-run preview.
    pub fn plan(&self, declaration: &PackageDeclaration) -> Result<InstallationPlan, CoreError> {
        let dependencies = self.resolver.resolve(declaration)?;
        let plan = InstallationPlan::build(declaration.name.clone(), dependencies)?;
        debug!("planned {} dependencies for '{}'", plan.len(), plan.package());
        Ok(plan)
    }

    pub fn run_installation(
        &self,
        declaration: &PackageDeclaration,
        options: InstallOptions,
    ) -> Result<InstallationReport, CoreError> {
        let plan = self.plan(declaration)?;
        self.execute_plan(&plan, options)
    }

    /// Drive an already-built plan through consent, execution and, on
    /// failure, rollback.
    ///
    /// Errors are returned only for pre-execution failures; anything that
    /// goes wrong once execution starts is reported in the
    /// [`InstallationReport`].
    pub fn execute_plan(
        &self,
        plan: &InstallationPlan,
        options: InstallOptions,
    ) -> Result<InstallationReport, CoreError> {
        let mut state = OrchestratorState::Planning;
        plan.validate()?;
        let fingerprint = plan.fingerprint()?;
        if let Some(expected) = &options.expected_fingerprint {
            if *expected != fingerprint {
                return Err(CoreError::PlanMismatch {
                    expected: expected.to_string(),
                    actual: fingerprint.into_inner(),
                });
            }
        }
        let installers = self.installers_for(plan)?;

        advance(&mut state, OrchestratorState::AwaitingConsent)?;
        self.consent.evaluate(plan, options.consent_flags())?;
        advance(&mut state, OrchestratorState::Executing)?;

        let bus = Arc::new(ProgressBus::new());
        for mut observer in options.observers {
            bus.subscribe(move |event: &ProgressEvent| observer.on_event(event));
        }
        debug!("{} progress observers attached", bus.subscriber_count());

        let mut run = Run {
            ledger: ExecutionLedger::from_plan(plan),
            bus: Arc::clone(&bus),
            sequence: SequenceCounter::new(),
            simulation: options.simulation,
            timeout: options.timeout,
            concurrency: options.concurrency,
            interrupted: Arc::clone(&self.interrupted),
            trigger: None,
        };
        info!(
            "installing {} dependencies for '{}'{}",
            plan.len(),
            plan.package(),
            if run.simulation { " (simulation)" } else { "" }
        );

        run.execute(plan, &installers);

        if run.trigger.is_some() {
            advance(&mut state, OrchestratorState::RollingBack)?;
            let summary = rollback::unwind(
                &mut run.ledger,
                &installers,
                &bus,
                &run.sequence,
                run.simulation,
            )?;
            info!(
                "rollback finished: {} undone, {} failed",
                summary.rolled_back, summary.failed
            );
            advance(&mut state, OrchestratorState::Failed)?;
        } else {
            rollback::commit(&run.ledger, &installers, &bus, &run.sequence, run.simulation);
            advance(&mut state, OrchestratorState::Completed)?;
        }

        // Flush every observer before handing back the report.
        bus.close();
        debug!("{} progress events emitted", run.sequence.current());

        Ok(InstallationReport::new(
            plan.package().to_owned(),
            fingerprint,
            run.simulation,
            run.ledger.into_entries(),
            run.trigger,
        ))
    }

    /// One installer per non-empty stage, resolved before anything runs.
    fn installers_for(&self, plan: &InstallationPlan) -> Result<InstallerMap, CoreError> {
        let mut map = InstallerMap::new();
        for stage in plan.stages().iter().filter(|s| !s.is_empty()) {
            let installer = self.registry.resolve(stage.kind())?;
            if let Some(dep) = stage.dependencies().iter().find(|d| !installer.can_handle(d)) {
                return Err(InstallerError::Unsupported {
                    installer: installer.name().to_owned(),
                    dependency: dep.key().into_inner(),
                }
                .into());
            }
            map.insert(stage.kind(), installer);
        }
        Ok(map)
    }
}

fn advance(state: &mut OrchestratorState, to: OrchestratorState) -> Result<(), CoreError> {
    validate_transition(*state, to)?;
    debug!("orchestrator: {} -> {to}", *state);
    *state = to;
    Ok(())
}

/// What a worker tells the orchestrator thread.
enum WorkerReport {
    Started(DependencyKey),
    Satisfied(DependencyKey),
    Finished(DependencyKey, Result<Installed, InstallerError>),
    NotStarted(DependencyKey),
}

/// Mutable state of one request while executing.
struct Run {
    ledger: ExecutionLedger,
    bus: Arc<ProgressBus>,
    sequence: SequenceCounter,
    simulation: bool,
    timeout: Option<Duration>,
    concurrency: Option<usize>,
    interrupted: InterruptCheck,
    trigger: Option<TriggerError>,
}

impl Run {
    fn execute(&mut self, plan: &InstallationPlan, installers: &InstallerMap) {
        for stage in plan.stages().iter().filter(|s| !s.is_empty()) {
            self.check_interrupt(None);
            if self.trigger.is_some() {
                break;
            }
            match installers.get(&stage.kind()) {
                Some(installer) => self.run_stage(stage, installer),
                None => self.halt(None, CoreError::InstallerNotFound(stage.kind()).to_string(), None),
            }
        }

        if self.trigger.is_some() {
            let skipped = self.ledger.skip_pending();
            if skipped > 0 {
                info!("skipped {skipped} dependencies after failure");
            }
        }
    }

    fn run_stage(&mut self, stage: &Stage, installer: &Arc<dyn Installer>) {
        let workers = self.concurrency.unwrap_or(stage.len()).clamp(1, stage.len());
        let frontier = Frontier::new(stage);
        info!(
            "{} stage: {} dependencies, {} ready, {workers} workers",
            stage.kind(),
            stage.len(),
            frontier.ready()
        );

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let worker = Worker {
                    frontier: &frontier,
                    installer: installer.as_ref(),
                    cancel: cancel.clone(),
                    bus: Arc::clone(&self.bus),
                    sequence: self.sequence.clone(),
                    simulation: self.simulation,
                    timeout: self.timeout,
                };
                let tx = tx.clone();
                scope.spawn(move || worker.run(&tx));
            }
            drop(tx);

            loop {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(report) => self.absorb(report, &cancel),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                self.check_interrupt(Some(&cancel));
            }
        });
    }

    /// Record a report. A ledger that refuses it fails the run like any
    /// installer error.
    fn absorb(&mut self, report: WorkerReport, cancel: &CancellationToken) {
        if let Err(e) = self.record(report, cancel) {
            warn!("could not record progress: {e}");
            self.halt(None, e.to_string(), Some(cancel));
        }
    }

    fn record(&mut self, report: WorkerReport, cancel: &CancellationToken) -> Result<(), CoreError> {
        match report {
            WorkerReport::Started(key) => self.ledger.mark_running(&key),
            WorkerReport::Satisfied(key) => {
                info!("{key} already satisfied");
                self.ledger.mark_skipped(&key, SkipReason::AlreadySatisfied)
            }
            WorkerReport::NotStarted(key) => {
                debug!("{key} not started");
                self.ledger.mark_skipped(&key, SkipReason::Halted)
            }
            WorkerReport::Finished(key, Ok(installed)) => {
                let sequence = self.ledger.mark_completed(&key, installed)?;
                debug!("{key} completed (#{sequence})");
                Ok(())
            }
            WorkerReport::Finished(key, Err(e)) => {
                let message = e.to_string();
                if self.trigger.is_none() {
                    warn!("{key} failed: {message}; cancelling remaining work");
                } else {
                    debug!("{key} failed after cancellation: {message}");
                }
                self.halt(Some(key.to_string()), message.clone(), Some(cancel));
                self.ledger.mark_failed(&key, message)
            }
        }
    }

    /// Record the first failure as the trigger and stop the stage. Later
    /// calls only cancel.
    fn halt(&mut self, dependency: Option<String>, message: String, cancel: Option<&CancellationToken>) {
        if self.trigger.is_none() {
            self.trigger = Some(TriggerError { dependency, message });
        }
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    /// Turn a pending interrupt into a failure of the whole run.
    fn check_interrupt(&mut self, cancel: Option<&CancellationToken>) {
        if self.trigger.is_none() && (self.interrupted)() {
            warn!("interrupted, cancelling installation");
            self.halt(None, "interrupted".to_owned(), cancel);
        }
    }
}

/// Dependencies of one stage that are ready to start, plus how many are
/// still owed a report.
struct Frontier<'d> {
    stage: &'d Stage,
    state: Mutex<FrontierState<'d>>,
    changed: Condvar,
}

struct FrontierState<'d> {
    ready: VecDeque<&'d Dependency>,
    unsettled: usize,
}

impl<'d> Frontier<'d> {
    fn new(stage: &'d Stage) -> Self {
        Self {
            stage,
            state: Mutex::new(FrontierState {
                ready: stage.roots().into(),
                unsettled: stage.len(),
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FrontierState<'d>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready(&self) -> usize {
        self.lock().ready.len()
    }

    /// Block until a dependency is ready. `None` once every member of the
    /// stage has settled.
    fn next(&self) -> Option<&'d Dependency> {
        let mut state = self.lock();
        loop {
            if let Some(dependency) = state.ready.pop_front() {
                return Some(dependency);
            }
            if state.unsettled == 0 {
                return None;
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Mark `dependency` done. When it is usable its successors become
    /// ready; otherwise every transitive successor is halted and returned.
    fn settle(&self, dependency: &Dependency, usable: bool) -> Vec<&'d Dependency> {
        let mut halted = Vec::new();
        {
            let mut state = self.lock();
            state.unsettled = state.unsettled.saturating_sub(1);
            if usable {
                state.ready.extend(self.stage.successors(&dependency.name));
            } else {
                let mut pending = self.stage.successors(&dependency.name);
                while let Some(next) = pending.pop() {
                    pending.extend(self.stage.successors(&next.name));
                    halted.push(next);
                }
                state.unsettled = state.unsettled.saturating_sub(halted.len());
            }
        }
        self.changed.notify_all();
        halted
    }
}

struct Worker<'q, 'd> {
    frontier: &'q Frontier<'d>,
    installer: &'q dyn Installer,
    cancel: CancellationToken,
    bus: Arc<ProgressBus>,
    sequence: SequenceCounter,
    simulation: bool,
    timeout: Option<Duration>,
}

impl Worker<'_, '_> {
    /// A failed or unstarted dependency halts everything ordered after it.
    fn run(&self, tx: &Sender<WorkerReport>) {
        while let Some(dependency) = self.frontier.next() {
            let usable = if self.cancel.is_cancelled() {
                let _ = tx.send(WorkerReport::NotStarted(dependency.key()));
                false
            } else {
                let report = self.install(dependency, tx);
                let usable = !matches!(report, WorkerReport::Finished(_, Err(_)));
                let _ = tx.send(report);
                usable
            };
            for halted in self.frontier.settle(dependency, usable) {
                let _ = tx.send(WorkerReport::NotStarted(halted.key()));
            }
        }
    }

    fn install(&self, dependency: &Dependency, tx: &Sender<WorkerReport>) -> WorkerReport {
        let key = dependency.key();
        let emitter = ProgressEmitter::new(key.clone(), Arc::clone(&self.bus), self.sequence.clone());
        let ctx = InstallContext::new(emitter, self.cancel.clone()).with_simulation(self.simulation);

        match guarded(|| self.installer.is_already_satisfied(dependency, &ctx)) {
            Ok(true) => {
                ctx.emitter()
                    .emit(ProgressPhase::Completed, Some(100), "already satisfied");
                return WorkerReport::Satisfied(key);
            }
            Ok(false) => {}
            Err(e) => {
                let _ = tx.send(WorkerReport::Started(key.clone()));
                ctx.emitter().emit(ProgressPhase::Failed, None, e.to_string());
                return WorkerReport::Finished(key, Err(e));
            }
        }

        let _ = tx.send(WorkerReport::Started(key.clone()));
        ctx.emitter().emit(
            ProgressPhase::Started,
            Some(0),
            format!("installing {}", dependency.requirement()),
        );
        let ctx = ctx.with_timeout(self.timeout);
        let result = guarded(|| self.installer.install(dependency, &ctx));
        match &result {
            Ok(installed) => ctx.emitter().emit(
                ProgressPhase::Completed,
                Some(100),
                installed
                    .version
                    .as_deref()
                    .map_or_else(|| "installed".to_owned(), |v| format!("installed {v}")),
            ),
            Err(e) => ctx.emitter().emit(ProgressPhase::Failed, None, e.to_string()),
        }
        WorkerReport::Finished(key, result)
    }
}

/// Run an installer call, turning a panic into an ordinary failure.
pub(crate) fn guarded<T>(call: impl FnOnce() -> Result<T, InstallerError>) -> Result<T, InstallerError> {
    catch_unwind(AssertUnwindSafe(call))
        .unwrap_or_else(|_| Err(InstallerError::Failed("installer panicked".to_owned())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::DeclarationResolver;
    use hatch_installers::MockInstaller;
    use hatch_schema::parse_declaration_str;

    fn orchestrator(mock: &Arc<MockInstaller>) -> Orchestrator {
        let mut registry = InstallerRegistry::new();
        for kind in DependencyKind::STAGE_ORDER {
            registry
                .register_instance(kind, Arc::clone(mock) as Arc<dyn Installer>)
                .unwrap();
        }
        Orchestrator::new(registry, DeclarationResolver::new()).with_consent(
            ConsentGate::stdio()
                .with_interactive(|| false)
                .with_env_lookup(|_| None),
        )
    }

    fn declaration(json: &str) -> PackageDeclaration {
        parse_declaration_str(json).unwrap()
    }

    fn run_for(plan: &InstallationPlan) -> Run {
        Run {
            ledger: ExecutionLedger::from_plan(plan),
            bus: Arc::new(ProgressBus::new()),
            sequence: SequenceCounter::new(),
            simulation: false,
            timeout: None,
            concurrency: None,
            interrupted: Arc::new(|| false),
            trigger: None,
        }
    }

    #[test]
    fn report_the_ledger_refuses_fails_the_run() {
        let plan = InstallationPlan::build(
            "pkg",
            vec![
                Dependency::new(DependencyKind::Runtime, "a"),
                Dependency::new(DependencyKind::Runtime, "b"),
            ],
        )
        .unwrap();
        let mut run = run_for(&plan);
        let cancel = CancellationToken::new();
        let a = DependencyKey::new("runtime:a");
        run.absorb(WorkerReport::Started(a.clone()), &cancel);
        run.absorb(WorkerReport::Finished(a.clone(), Ok(Installed::default())), &cancel);
        assert!(run.trigger.is_none());

        // Completion without a start.
        let b = DependencyKey::new("runtime:b");
        run.absorb(WorkerReport::Finished(b, Ok(Installed::default())), &cancel);
        assert!(cancel.is_cancelled());
        let trigger = run.trigger.clone().unwrap();
        assert!(trigger.dependency.is_none());
        assert_eq!(run.ledger.completed_in_reverse().len(), 1);

        let mock = Arc::new(MockInstaller::new());
        let mut installers = InstallerMap::new();
        installers.insert(DependencyKind::Runtime, Arc::clone(&mock) as Arc<dyn Installer>);
        let summary =
            rollback::unwind(&mut run.ledger, &installers, &run.bus, &run.sequence, false).unwrap();
        assert_eq!(summary.rolled_back, 1);
        assert_eq!(mock.uninstalls(), vec!["runtime:a"]);
    }

    #[test]
    fn tampered_plan_is_rejected_before_execution() {
        let mock = Arc::new(MockInstaller::new());
        let orch = orchestrator(&mock);
        let plan = orch
            .plan(&declaration(r#"{"name": "app", "python_dependencies": [{"name": "requests"}]}"#))
            .unwrap();
        let json = plan.canonical_json().unwrap().replace("requests", "../requests");
        let tampered: InstallationPlan = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            orch.execute_plan(&tampered, InstallOptions::default()),
            Err(CoreError::Plan(_))
        ));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn fingerprint_mismatch_is_rejected_before_execution() {
        let mock = Arc::new(MockInstaller::new());
        let orch = orchestrator(&mock);
        let decl = declaration(r#"{"name": "app", "python_dependencies": [{"name": "requests"}]}"#);
        let options = InstallOptions {
            expected_fingerprint: Some(PlanFingerprint::new("deadbeef")),
            ..InstallOptions::default()
        };
        assert!(matches!(
            orch.run_installation(&decl, options),
            Err(CoreError::PlanMismatch { .. })
        ));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn matching_fingerprint_runs() {
        let mock = Arc::new(MockInstaller::new());
        let orch = orchestrator(&mock);
        let decl = declaration(r#"{"name": "app", "python_dependencies": [{"name": "requests"}]}"#);
        let fingerprint = orch.plan(&decl).unwrap().fingerprint().unwrap();
        let options = InstallOptions {
            expected_fingerprint: Some(fingerprint),
            ..InstallOptions::default()
        };
        assert!(orch.run_installation(&decl, options).unwrap().is_success());
    }

    #[test]
    fn missing_installer_fails_before_consent() {
        let mut registry = InstallerRegistry::new();
        registry
            .register_instance(DependencyKind::Runtime, Arc::new(MockInstaller::new()))
            .unwrap();
        let orch = Orchestrator::new(registry, DeclarationResolver::new())
            .with_consent(ConsentGate::stdio().with_interactive(|| true));
        let decl = declaration(r#"{"name": "app", "docker_dependencies": [{"name": "redis"}]}"#);
        assert!(matches!(
            orch.run_installation(&decl, InstallOptions::default()),
            Err(CoreError::InstallerNotFound(DependencyKind::Container))
        ));
    }

    #[test]
    fn panicking_installer_is_an_ordinary_failure() {
        struct Panics;
        impl Installer for Panics {
            fn name(&self) -> &str {
                "panics"
            }
            fn can_handle(&self, _: &Dependency) -> bool {
                true
            }
            fn is_already_satisfied(&self, _: &Dependency, _: &InstallContext) -> Result<bool, InstallerError> {
                Ok(false)
            }
            fn install(&self, _: &Dependency, _: &InstallContext) -> Result<Installed, InstallerError> {
                panic!("backend bug")
            }
            fn uninstall(&self, _: &Dependency, _: &InstallContext) -> Result<(), InstallerError> {
                Ok(())
            }
        }

        let mut registry = InstallerRegistry::new();
        registry
            .register_instance(DependencyKind::System, Arc::new(Panics))
            .unwrap();
        let orch = Orchestrator::new(registry, DeclarationResolver::new())
            .with_consent(ConsentGate::stdio().with_interactive(|| false));
        let decl = declaration(r#"{"name": "app", "system_dependencies": [{"name": "git"}]}"#);
        let report = orch.run_installation(&decl, InstallOptions::default()).unwrap();
        assert!(!report.is_success());
        let trigger = report.trigger.unwrap();
        assert_eq!(trigger.dependency.as_deref(), Some("system:git"));
        assert!(trigger.message.contains("panicked"));
    }
}

use crate::ledger::ExecutionLedger;
use crate::orchestrator::{guarded, InstallerMap};
use crate::CoreError;
use hatch_installers::{CancellationToken, InstallContext, ProgressBus, ProgressEmitter, SequenceCounter};
use hatch_schema::{Dependency, ProgressPhase};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RollbackSummary {
    pub rolled_back: usize,
    pub failed: usize,
}

/// Undo every completed entry, most recent completion first.
///
/// A failed `uninstall` is recorded and the unwind carries on. Uninstall
/// calls get a fresh token that is never cancelled.
pub(crate) fn unwind(
    ledger: &mut ExecutionLedger,
    installers: &InstallerMap,
    bus: &Arc<ProgressBus>,
    sequence: &SequenceCounter,
    simulation: bool,
) -> Result<RollbackSummary, CoreError> {
    let targets: Vec<Dependency> = ledger
        .completed_in_reverse()
        .into_iter()
        .map(|e| e.dependency.clone())
        .collect();
    if targets.is_empty() {
        info!("nothing to roll back");
        return Ok(RollbackSummary::default());
    }
    info!("rolling back {} completed dependencies", targets.len());

    let mut summary = RollbackSummary::default();
    for dependency in &targets {
        let key = dependency.key();
        let emitter = ProgressEmitter::new(key.clone(), Arc::clone(bus), sequence.clone());
        let ctx = InstallContext::new(emitter, CancellationToken::new()).with_simulation(simulation);
        ctx.progress(None, "rolling back");

        let outcome = match installers.get(&dependency.kind) {
            Some(installer) => guarded(|| installer.uninstall(dependency, &ctx)).map_err(|e| e.to_string()),
            None => Err(format!("no installer for {}", dependency.kind)),
        };
        match outcome {
            Ok(()) => {
                ledger.mark_rolled_back(&key)?;
                ctx.progress(Some(100), "rolled back");
                summary.rolled_back += 1;
            }
            Err(message) => {
                warn!("rollback of {key} failed: {message}");
                ctx.emitter()
                    .emit(ProgressPhase::Failed, None, format!("rollback failed: {message}"));
                ledger.mark_rollback_failed(&key, message)?;
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

/// Tell each installer its completed work is final, so it can drop
/// whatever it kept for `uninstall`. Failures only warn.
pub(crate) fn commit(
    ledger: &ExecutionLedger,
    installers: &InstallerMap,
    bus: &Arc<ProgressBus>,
    sequence: &SequenceCounter,
    simulation: bool,
) {
    for entry in ledger.completed_in_reverse() {
        let dependency = &entry.dependency;
        let Some(installer) = installers.get(&dependency.kind) else {
            continue;
        };
        let emitter = ProgressEmitter::new(dependency.key(), Arc::clone(bus), sequence.clone());
        let ctx = InstallContext::new(emitter, CancellationToken::new()).with_simulation(simulation);
        if let Err(e) = guarded(|| installer.commit(dependency, &ctx)) {
            warn!("commit of {} failed: {e}", dependency.key());
        }
    }
}

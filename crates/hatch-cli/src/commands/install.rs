use super::{
    colorize_status, json_pretty, spin_fail, spin_ok, spinner, Workspace, EXIT_FAILURE,
    EXIT_ROLLBACK_INCOMPLETE, EXIT_SUCCESS,
};
use hatch_core::{
    validate_env_name, CoreError, EnvironmentStore, InstallOptions, InstallationReport, Outcome,
};
use hatch_schema::{parse_declaration_file, DependencyKey, PlanFingerprint, ProgressEvent, ProgressPhase};
use indicatif::{MultiProgress, ProgressBar};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct InstallArgs {
    pub env: String,
    pub yes: bool,
    pub no: bool,
    pub dry_run: bool,
    pub jobs: Option<usize>,
    pub timeout: Option<u64>,
    pub expect_plan: Option<String>,
}

pub fn run(home: &Path, package: &Path, args: &InstallArgs, json: bool) -> Result<u8, String> {
    validate_env_name(&args.env).map_err(|e| e.to_string())?;
    if args.jobs == Some(0) {
        return Err("--jobs must be at least 1".to_owned());
    }
    let declaration = parse_declaration_file(package).map_err(|e| CoreError::from(e).to_string())?;
    let workspace = Workspace::open(home)?;
    let orchestrator = workspace.orchestrator(&args.env)?;

    let mut options = InstallOptions {
        auto_approve: args.yes,
        refuse: args.no,
        simulation: args.dry_run,
        concurrency: args.jobs.or(workspace.config.concurrency),
        timeout: args
            .timeout
            .map(Duration::from_secs)
            .or_else(|| workspace.config.dependency_timeout()),
        expected_fingerprint: args.expect_plan.clone().map(PlanFingerprint::new),
        observers: Vec::new(),
    };
    if !json {
        options = options.with_observer(progress_printer());
    }

    let report = orchestrator
        .run_installation(&declaration, options)
        .map_err(|e| e.to_string())?;

    if !report.manifest.is_empty() {
        workspace
            .store
            .record_manifest(&args.env, &report.manifest)
            .map_err(|e| e.to_string())?;
    }

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        print_report(&report, &args.env);
    }

    Ok(match report.outcome {
        Outcome::Succeeded => EXIT_SUCCESS,
        Outcome::RolledBack => EXIT_FAILURE,
        Outcome::RollbackIncomplete => EXIT_ROLLBACK_INCOMPLETE,
    })
}

/// Observer drawing one spinner per dependency; runs on the bus's
/// delivery thread, so it owns all of its bars.
fn progress_printer() -> impl FnMut(&ProgressEvent) + Send {
    let multi = MultiProgress::new();
    let mut bars: HashMap<DependencyKey, ProgressBar> = HashMap::new();
    move |event: &ProgressEvent| {
        let key = &event.dependency_key;
        let label = match event.percent {
            Some(p) if !event.message.is_empty() => format!("{key} {p}% {}", event.message),
            Some(p) => format!("{key} {p}%"),
            None if event.message.is_empty() => key.to_string(),
            None => format!("{key}: {}", event.message),
        };
        match event.phase {
            ProgressPhase::Started | ProgressPhase::Progress => {
                let bar = bars
                    .entry(key.clone())
                    .or_insert_with(|| multi.add(spinner(&key.to_string())));
                bar.set_message(label);
            }
            ProgressPhase::Completed => {
                let bar = bars.remove(key).unwrap_or_else(|| multi.add(ProgressBar::new_spinner()));
                spin_ok(&bar, &label);
            }
            ProgressPhase::Failed => {
                let bar = bars.remove(key).unwrap_or_else(|| multi.add(ProgressBar::new_spinner()));
                spin_fail(&bar, &label);
            }
        }
    }
}

fn print_report(report: &InstallationReport, environment: &str) {
    let mode = if report.simulation { " (dry run)" } else { "" };
    println!("package '{}'{mode}: {}", report.package, report.outcome);
    for result in &report.results {
        let status = result.status.to_string();
        let mut line = format!("  {:<12} {}", colorize_status(&status), result.key());
        if let Some(version) = &result.installed_version {
            let _ = write!(line, " {version}");
        }
        if let Some(error) = &result.error {
            let _ = write!(line, " ({})", error.message());
        }
        println!("{line}");
    }
    if let Some(trigger) = &report.trigger {
        let source = trigger.dependency.as_deref().unwrap_or("interrupt");
        println!("cause: {source}: {}", trigger.message);
    }
    match report.outcome {
        Outcome::Succeeded if !report.manifest.is_empty() => {
            println!("recorded {} dependencies in '{environment}'", report.manifest.len());
        }
        Outcome::RollbackIncomplete => {
            let keys: Vec<String> = report
                .rollback_failures()
                .map(|r| r.key().into_inner())
                .collect();
            eprintln!("manual cleanup required for: {}", keys.join(", "));
        }
        _ => {}
    }
}

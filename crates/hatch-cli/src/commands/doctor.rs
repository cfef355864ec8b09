use super::{Workspace, EXIT_FAILURE, EXIT_SUCCESS};
use hatch_core::StoreLock;
use hatch_installers::{check_backend_prereqs, format_missing};
use std::path::Path;

pub fn run(home: &Path, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    let workspace = match Workspace::open(home) {
        Ok(ws) => {
            checks.push(Check::pass("config", "Configuration is valid"));
            ws
        }
        Err(e) => {
            checks.push(Check::fail("config", &e));
            return print_results(&checks, false, json_output);
        }
    };

    check_backend(&workspace, &mut checks, &mut all_pass);
    check_store(&workspace, &mut checks, &mut all_pass);

    print_results(&checks, all_pass, json_output)
}

fn check_backend(workspace: &Workspace, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match workspace.backend.as_str() {
        "mock" => checks.push(Check::info(
            "backend",
            "Mock backend selected; nothing is installed for real",
        )),
        "system" => {
            let config = workspace
                .config
                .backend_config(workspace.store.environment_dir("default"));
            let missing = check_backend_prereqs(&config);
            if missing.is_empty() {
                checks.push(Check::pass("backend_prereqs", "Backend tools available"));
            } else {
                // Only the affected dependency kinds are unusable.
                checks.push(Check::warn("backend_prereqs", &format_missing(&missing)));
            }
        }
        other => {
            *all_pass = false;
            checks.push(Check::fail(
                "backend",
                &format!("Unknown installer backend '{other}'"),
            ));
        }
    }

    match workspace.package_source() {
        Some(dir) if dir.is_dir() => checks.push(Check::pass(
            "package_source",
            &format!("Package source {}", dir.display()),
        )),
        Some(dir) => {
            *all_pass = false;
            checks.push(Check::fail(
                "package_source",
                &format!("Package source {} does not exist", dir.display()),
            ));
        }
        None => checks.push(Check::info(
            "package_source",
            "No local package source configured",
        )),
    }
}

fn check_store(workspace: &Workspace, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let store = &workspace.store;
    match store.environments() {
        Ok(envs) => checks.push(Check::info(
            "environments",
            &format!("{} environments recorded", envs.len()),
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "environments",
                &format!("Cannot read environments: {e}"),
            ));
            return;
        }
    }

    if !store.lock_path().exists() {
        return;
    }
    match StoreLock::try_acquire(&store.lock_path()) {
        Ok(Some(_)) => checks.push(Check::pass("store_lock", "Environment lock is free")),
        Ok(None) => checks.push(Check::warn(
            "store_lock",
            "Environment lock is held by another process",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "store_lock",
                &format!("Cannot check environment lock: {e}"),
            ));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("Hatch Doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

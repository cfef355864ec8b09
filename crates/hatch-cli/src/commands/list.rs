use super::{json_pretty, Workspace, EXIT_SUCCESS};
use hatch_core::{validate_env_name, EnvironmentStore};
use std::path::Path;

pub fn run(home: &Path, environment: Option<&str>, json: bool) -> Result<u8, String> {
    let workspace = Workspace::open(home)?;
    let store = &workspace.store;

    let Some(environment) = environment else {
        let envs = store.environments().map_err(|e| e.to_string())?;
        if json {
            println!("{}", json_pretty(&envs)?);
        } else if envs.is_empty() {
            println!("no environments found");
        } else {
            for env in &envs {
                println!("{env}");
            }
        }
        return Ok(EXIT_SUCCESS);
    };

    validate_env_name(environment).map_err(|e| e.to_string())?;
    let records = store.installed(environment).map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&records)?);
    } else if records.is_empty() {
        println!("no dependencies recorded in '{environment}'");
    } else {
        println!("{:<10} {:<24} {:<12} INSTALLED_AT", "KIND", "NAME", "VERSION");
        for r in &records {
            println!(
                "{:<10} {:<24} {:<12} {}",
                r.kind.to_string(),
                r.name,
                r.version.as_deref().unwrap_or("-"),
                r.installed_at
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

use super::{json_pretty, Workspace, EXIT_SUCCESS};
use hatch_core::CoreError;
use hatch_schema::parse_declaration_file;
use std::path::Path;

pub fn run(home: &Path, package: &Path, json: bool) -> Result<u8, String> {
    let declaration = parse_declaration_file(package).map_err(|e| CoreError::from(e).to_string())?;
    let workspace = Workspace::open(home)?;
    let orchestrator = workspace.orchestrator("default")?;
    let plan = orchestrator.plan(&declaration).map_err(|e| e.to_string())?;
    let fingerprint = plan
        .fingerprint()
        .map_err(|e| CoreError::from(e).to_string())?;

    if json {
        let payload = serde_json::json!({
            "package": plan.package(),
            "fingerprint": fingerprint,
            "dependencies": plan.len(),
            "stages": plan.stages(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        print!("{}", plan.summary());
        println!("fingerprint: {fingerprint}");
    }
    Ok(EXIT_SUCCESS)
}

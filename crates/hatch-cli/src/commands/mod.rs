pub mod completions;
pub mod doctor;
pub mod install;
pub mod list;
pub mod man_pages;
pub mod plan;

use dialoguer::Confirm;
use hatch_core::{
    ConsentGate, ConsentPrompt, CoreError, DeclarationResolver, HatchConfig,
    JsonEnvironmentStore, Orchestrator, BACKEND_ENV,
};
use hatch_installers::{select_backends, PackageSource};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_PLAN_ERROR: u8 = 2;
pub const EXIT_CONSENT_DENIED: u8 = 3;
pub const EXIT_ROLLBACK_INCOMPLETE: u8 = 4;

const PACKAGES_DIR: &str = "packages";

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        style("{spinner:.cyan} {msg}")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "completed" => Style::new().green().apply_to(status).to_string(),
        "running" => Style::new().cyan().bold().apply_to(status).to_string(),
        "skipped" => Style::new().dim().apply_to(status).to_string(),
        "rolled_back" => Style::new().yellow().apply_to(status).to_string(),
        "failed" => Style::new().red().bold().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

/// Everything a command needs to talk to the hatch home.
pub struct Workspace {
    pub config: HatchConfig,
    pub store: JsonEnvironmentStore,
    pub backend: String,
}

impl Workspace {
    pub fn open(home: &Path) -> Result<Self, String> {
        let config = HatchConfig::load_from_home(home).map_err(|e| e.to_string())?;
        let env_backend = std::env::var(BACKEND_ENV).ok();
        let backend = config.backend_name(env_backend.as_deref());
        Ok(Self {
            config,
            store: JsonEnvironmentStore::new(home),
            backend,
        })
    }

    /// Local package source: the configured one, else `<home>/packages`.
    pub fn package_source(&self) -> Option<PathBuf> {
        self.config.package_source.clone().or_else(|| {
            let default = self.store.root().join(PACKAGES_DIR);
            default.is_dir().then_some(default)
        })
    }

    pub fn orchestrator(&self, environment: &str) -> Result<Orchestrator, String> {
        let mut backend_config = self
            .config
            .backend_config(self.store.environment_dir(environment));
        let source = self.package_source();
        backend_config.package_source.clone_from(&source);

        let registry = select_backends(&self.backend, &backend_config).map_err(|e| e.to_string())?;
        let resolver = match source {
            Some(root) => DeclarationResolver::new().with_source(PackageSource::new(root)),
            None => DeclarationResolver::new(),
        };
        Ok(Orchestrator::new(registry, resolver).with_consent(ConsentGate::new(TerminalPrompt)))
    }
}

/// Consent prompt on the controlling terminal.
struct TerminalPrompt;

impl ConsentPrompt for TerminalPrompt {
    fn confirm(&mut self, plan_summary: &str) -> Result<bool, CoreError> {
        eprintln!("{plan_summary}");
        Confirm::new()
            .with_prompt("Proceed with installation?")
            .interact()
            .map_err(|e| CoreError::ConsentDenied(format!("prompt failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes() {
        let value = serde_json::json!({"package": "demo"});
        let out = json_pretty(&value).unwrap();
        assert!(out.contains("\"package\": \"demo\""));
    }

    #[test]
    fn colorize_passes_unknown_through() {
        assert_eq!(colorize_status("pending"), "pending");
        assert!(colorize_status("failed").contains("failed"));
    }

    #[test]
    fn workspace_defaults_without_config() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        assert!(ws.package_source().is_none());

        std::fs::create_dir(dir.path().join(PACKAGES_DIR)).unwrap();
        assert_eq!(ws.package_source(), Some(dir.path().join(PACKAGES_DIR)));
    }

    #[test]
    fn mock_backend_builds_orchestrator() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = Workspace::open(dir.path()).unwrap();
        ws.backend = "mock".to_owned();
        let orchestrator = ws.orchestrator("default").unwrap();
        assert_eq!(orchestrator.registry().kinds().len(), 4);

        ws.backend = "conda".to_owned();
        assert!(ws.orchestrator("default").is_err());
    }
}

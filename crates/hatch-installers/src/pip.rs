use crate::command::{query, run, version_satisfies};
use crate::installer::{BackendConfig, InstallContext, Installed, Installer};
use crate::InstallerError;
use hatch_schema::{Dependency, DependencyKind};
use tracing::info;

/// Runtime dependencies through `python -m pip`.
pub struct PipInstaller {
    python: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct PipShow {
    version: Option<String>,
    location: Option<String>,
}

impl PipInstaller {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            python: config.python.clone(),
        }
    }

    fn show(&self, name: &str) -> Result<Option<PipShow>, InstallerError> {
        let out = query(&self.python, &["-m", "pip", "show", name])?;
        if !out.success {
            return Ok(None);
        }
        Ok(Some(parse_show(&out.stdout)))
    }

    fn pip_args(&self, tail: &[&str]) -> Vec<String> {
        let mut args = vec!["-m".to_owned(), "pip".to_owned()];
        args.extend(tail.iter().map(|s| (*s).to_owned()));
        args
    }
}

fn parse_show(stdout: &str) -> PipShow {
    let mut show = PipShow::default();
    for line in stdout.lines() {
        if let Some(v) = line.strip_prefix("Version:") {
            show.version = Some(v.trim().to_owned());
        } else if let Some(l) = line.strip_prefix("Location:") {
            show.location = Some(l.trim().to_owned());
        }
    }
    show
}

impl Installer for PipInstaller {
    fn name(&self) -> &'static str {
        "pip"
    }

    fn can_handle(&self, dependency: &Dependency) -> bool {
        dependency.kind == DependencyKind::Runtime
            && matches!(dependency.backend_hint.as_deref(), None | Some("pip"))
    }

    fn is_already_satisfied(
        &self,
        dependency: &Dependency,
        _ctx: &InstallContext,
    ) -> Result<bool, InstallerError> {
        let Some(show) = self.show(&dependency.name)? else {
            return Ok(false);
        };
        let Some(installed) = show.version else {
            return Ok(false);
        };
        let wanted = dependency
            .resolved_version
            .as_deref()
            .map(|v| format!("=={v}"));
        let constraint = wanted.as_deref().or(dependency.version_constraint.as_deref());
        Ok(version_satisfies(&installed, constraint))
    }

    fn install(
        &self,
        dependency: &Dependency,
        ctx: &InstallContext,
    ) -> Result<Installed, InstallerError> {
        let requirement = match &dependency.resolved_version {
            Some(v) => format!("{}=={v}", dependency.name),
            None => dependency.requirement(),
        };
        let mut tail = vec!["install", requirement.as_str()];
        if ctx.simulation() {
            tail.push("--dry-run");
        }
        ctx.progress(Some(10), format!("pip install {requirement}"));
        run(&self.python, &self.pip_args(&tail), ctx)?;

        if ctx.simulation() {
            return Ok(Installed::new(dependency.resolved_version.clone(), None));
        }
        let show = self.show(&dependency.name)?.unwrap_or_default();
        info!(
            "installed {} {}",
            dependency.name,
            show.version.as_deref().unwrap_or("?")
        );
        Ok(Installed::new(
            show.version.or_else(|| dependency.resolved_version.clone()),
            show.location,
        ))
    }

    fn uninstall(
        &self,
        dependency: &Dependency,
        ctx: &InstallContext,
    ) -> Result<(), InstallerError> {
        if ctx.simulation() {
            ctx.progress(None, format!("would uninstall {}", dependency.name));
            return Ok(());
        }
        if self.show(&dependency.name)?.is_none() {
            return Ok(());
        }
        run(
            &self.python,
            &self.pip_args(&["uninstall", "-y", &dependency.name]),
            ctx,
        )?;
        Ok(())
    }
}

use crate::command::{query, run};
use crate::installer::{BackendConfig, InstallContext, Installed, Installer};
use crate::InstallerError;
use hatch_schema::{Dependency, DependencyKind};
use tracing::{info, warn};

/// System dependencies through `apt-get` and `dpkg-query`.
///
/// An exact version that apt cannot provide fails the install; the
/// backend never falls back to the latest available version.
pub struct AptInstaller {
    apt_get: String,
    dpkg_query: String,
}

impl AptInstaller {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            apt_get: config.apt_get.clone(),
            dpkg_query: config.dpkg_query.clone(),
        }
    }

    fn installed_version(&self, name: &str) -> Result<Option<String>, InstallerError> {
        let out = query(
            &self.dpkg_query,
            &["-W", "-f=${Status} ${Version}", name],
        )?;
        if !out.success {
            return Ok(None);
        }
        Ok(parse_status(&out.stdout))
    }
}

fn wanted_version(dependency: &Dependency) -> Option<&str> {
    dependency
        .resolved_version
        .as_deref()
        .or_else(|| dependency.pinned_version())
}

/// `install ok installed 2.34-1` -> `Some("2.34-1")`.
fn parse_status(line: &str) -> Option<String> {
    let rest = line.trim().strip_prefix("install ok installed")?;
    let version = rest.trim();
    (!version.is_empty()).then(|| version.to_owned())
}

impl Installer for AptInstaller {
    fn name(&self) -> &'static str {
        "apt"
    }

    fn can_handle(&self, dependency: &Dependency) -> bool {
        dependency.kind == DependencyKind::System
            && matches!(dependency.backend_hint.as_deref(), None | Some("apt"))
    }

    fn is_already_satisfied(
        &self,
        dependency: &Dependency,
        _ctx: &InstallContext,
    ) -> Result<bool, InstallerError> {
        let Some(installed) = self.installed_version(&dependency.name)? else {
            return Ok(false);
        };
        Ok(match wanted_version(dependency) {
            Some(v) => installed == v,
            None => true,
        })
    }

    fn install(
        &self,
        dependency: &Dependency,
        ctx: &InstallContext,
    ) -> Result<Installed, InstallerError> {
        let target = match wanted_version(dependency) {
            Some(v) => format!("{}={v}", dependency.name),
            None => {
                if dependency.version_constraint.is_some() {
                    warn!(
                        "apt cannot express range '{}'; installing candidate version of {}",
                        dependency.requirement(),
                        dependency.name
                    );
                }
                dependency.name.clone()
            }
        };
        let mut args = vec!["install".to_owned(), "-y".to_owned()];
        if ctx.simulation() {
            args.push("--simulate".to_owned());
        }
        args.push(target.clone());

        ctx.progress(Some(10), format!("apt-get install {target}"));
        if let Err(e) = run(&self.apt_get, &args, ctx) {
            if let (Some(v), InstallerError::CommandFailed { stderr, .. }) =
                (wanted_version(dependency), &e)
            {
                if stderr.contains("was not found") {
                    return Err(InstallerError::VersionUnavailable {
                        name: dependency.name.clone(),
                        version: v.to_owned(),
                    });
                }
            }
            return Err(e);
        }

        if ctx.simulation() {
            return Ok(Installed::new(wanted_version(dependency).map(str::to_owned), None));
        }
        let version = self.installed_version(&dependency.name)?;
        info!(
            "installed system package {} {}",
            dependency.name,
            version.as_deref().unwrap_or("?")
        );
        Ok(Installed::new(version, None))
    }

    fn uninstall(
        &self,
        dependency: &Dependency,
        ctx: &InstallContext,
    ) -> Result<(), InstallerError> {
        if ctx.simulation() {
            ctx.progress(None, format!("would remove {}", dependency.name));
            return Ok(());
        }
        if self.installed_version(&dependency.name)?.is_none() {
            return Ok(());
        }
        run(
            &self.apt_get,
            &["remove".to_owned(), "-y".to_owned(), dependency.name.clone()],
            ctx,
        )?;
        Ok(())
    }
}

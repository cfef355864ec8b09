use crate::command::{query, run};
use crate::installer::{BackendConfig, InstallContext, Installed, Installer};
use crate::InstallerError;
use hatch_schema::{Dependency, DependencyKind};
use tracing::info;

/// Container image dependencies through the docker CLI.
pub struct DockerInstaller {
    docker: String,
}

impl DockerInstaller {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            docker: config.docker.clone(),
        }
    }

    fn image_present(&self, reference: &str) -> Result<bool, InstallerError> {
        Ok(query(&self.docker, &["image", "inspect", reference])?.success)
    }
}

/// Full image reference: optional registry prefix, name, and tag.
///
/// The tag is the resolved version, else an exact or bare constraint,
/// else `latest`. The `dockerhub` hint means no registry prefix.
pub(crate) fn image_reference(dependency: &Dependency) -> String {
    let tag = dependency
        .resolved_version
        .as_deref()
        .or_else(|| dependency.pinned_version())
        .or_else(|| {
            dependency
                .version_constraint
                .as_deref()
                .map(str::trim)
                .filter(|c| {
                    !c.is_empty()
                        && c.chars()
                            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_'))
                })
        })
        .unwrap_or("latest");
    let registry = dependency
        .backend_hint
        .as_deref()
        .filter(|h| !h.is_empty() && *h != "dockerhub" && *h != "docker");
    match registry {
        Some(r) => format!("{}/{}:{tag}", r.trim_end_matches('/'), dependency.name),
        None => format!("{}:{tag}", dependency.name),
    }
}

impl Installer for DockerInstaller {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn can_handle(&self, dependency: &Dependency) -> bool {
        dependency.kind == DependencyKind::Container
    }

    fn is_already_satisfied(
        &self,
        dependency: &Dependency,
        _ctx: &InstallContext,
    ) -> Result<bool, InstallerError> {
        self.image_present(&image_reference(dependency))
    }

    fn install(
        &self,
        dependency: &Dependency,
        ctx: &InstallContext,
    ) -> Result<Installed, InstallerError> {
        let reference = image_reference(dependency);
        if ctx.simulation() {
            run(&self.docker, &["version".to_owned()], ctx)?;
            ctx.progress(None, format!("would pull {reference}"));
        } else {
            ctx.progress(Some(10), format!("pulling {reference}"));
            run(&self.docker, &["pull".to_owned(), reference.clone()], ctx)?;
            info!("pulled image {reference}");
        }
        let tag = reference.rsplit_once(':').map(|(_, t)| t.to_owned());
        Ok(Installed::new(tag, Some(reference)))
    }

    fn uninstall(
        &self,
        dependency: &Dependency,
        ctx: &InstallContext,
    ) -> Result<(), InstallerError> {
        let reference = image_reference(dependency);
        if ctx.simulation() {
            ctx.progress(None, format!("would remove {reference}"));
            return Ok(());
        }
        if !self.image_present(&reference)? {
            return Ok(());
        }
        run(&self.docker, &["rmi".to_owned(), reference], ctx)?;
        Ok(())
    }
}

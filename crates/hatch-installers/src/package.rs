use crate::installer::{BackendConfig, InstallContext, Installed, Installer};
use crate::InstallerError;
use hatch_schema::{parse_declaration_file, Dependency, DependencyKind, DECLARATION_FILE};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// A local directory of hatch packages, laid out as
/// `<root>/<name>/<version>/hatch_metadata.json` or
/// `<root>/<name>/hatch_metadata.json`.
#[derive(Debug, Clone)]
pub struct PackageSource {
    root: PathBuf,
}

impl PackageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every version of `name` present in the source, unordered.
    pub fn available_versions(&self, name: &str) -> Vec<String> {
        let base = self.root.join(name);
        let mut versions = Vec::new();
        if let Some(v) = declared_version(&base) {
            versions.push(v);
        }
        if let Ok(entries) = fs::read_dir(&base) {
            for entry in entries.flatten() {
                if let Some(v) = declared_version(&entry.path()) {
                    if !versions.contains(&v) {
                        versions.push(v);
                    }
                }
            }
        }
        versions
    }

    /// Directory holding `name` at exactly `version`.
    pub fn locate(&self, name: &str, version: &str) -> Option<PathBuf> {
        let base = self.root.join(name);
        let versioned = base.join(version);
        [versioned, base]
            .into_iter()
            .find(|dir| declared_version(dir).as_deref() == Some(version))
    }
}

fn declared_version(dir: &Path) -> Option<String> {
    if !dir.join(DECLARATION_FILE).is_file() {
        return None;
    }
    parse_declaration_file(dir).ok().map(|d| d.version)
}

struct Slots {
    target: PathBuf,
    /// Copy in progress, renamed onto `target` once complete.
    staging: PathBuf,
    /// The replaced install, kept until commit so uninstall can restore it.
    previous: PathBuf,
}

/// Inter-package dependencies: copies a hatch package into the
/// environment directory.
pub struct HatchPackageInstaller {
    source: Option<PackageSource>,
    environment_dir: PathBuf,
}

impl HatchPackageInstaller {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            source: config.package_source.clone().map(PackageSource::new),
            environment_dir: config.environment_dir.clone(),
        }
    }

    /// Directories one package occupies. `name` must be a single plain
    /// path component so nothing lands outside the environment.
    fn slots(&self, name: &str) -> Result<Slots, InstallerError> {
        let mut parts = Path::new(name).components();
        match (parts.next(), parts.next()) {
            (Some(Component::Normal(_)), None) if !name.starts_with('.') && !name.contains('/') => {
                Ok(Slots {
                    target: self.environment_dir.join(name),
                    staging: self.environment_dir.join(format!(".{name}.partial")),
                    previous: self.environment_dir.join(format!(".{name}.previous")),
                })
            }
            _ => Err(InstallerError::UnsafeName(name.to_owned())),
        }
    }

    fn source_dir(&self, dependency: &Dependency) -> Result<PathBuf, InstallerError> {
        let version = dependency.resolved_version.as_deref().unwrap_or_default();
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| InstallerError::Failed("no package source configured".to_owned()))?;
        source
            .locate(&dependency.name, version)
            .ok_or_else(|| InstallerError::VersionUnavailable {
                name: dependency.name.clone(),
                version: version.to_owned(),
            })
    }
}

impl Installer for HatchPackageInstaller {
    fn name(&self) -> &'static str {
        "hatch"
    }

    fn can_handle(&self, dependency: &Dependency) -> bool {
        dependency.kind == DependencyKind::Package
    }

    fn is_already_satisfied(
        &self,
        dependency: &Dependency,
        _ctx: &InstallContext,
    ) -> Result<bool, InstallerError> {
        let installed = declared_version(&self.slots(&dependency.name)?.target);
        Ok(installed.is_some() && installed == dependency.resolved_version)
    }

    fn install(
        &self,
        dependency: &Dependency,
        ctx: &InstallContext,
    ) -> Result<Installed, InstallerError> {
        let slots = self.slots(&dependency.name)?;
        let source = self.source_dir(dependency)?;
        ctx.check()?;

        if ctx.simulation() {
            ctx.progress(None, format!("would copy {}", source.display()));
            return Ok(Installed::new(
                dependency.resolved_version.clone(),
                Some(slots.target.display().to_string()),
            ));
        }

        if slots.staging.exists() {
            fs::remove_dir_all(&slots.staging)?;
        }
        fs::create_dir_all(&self.environment_dir)?;
        ctx.progress(Some(20), format!("copying {}", source.display()));
        copy_tree(&source, &slots.staging, ctx)?;
        ctx.check()?;
        if slots.target.exists() {
            if slots.previous.exists() {
                fs::remove_dir_all(&slots.previous)?;
            }
            debug!("keeping {} until commit", slots.target.display());
            fs::rename(&slots.target, &slots.previous)?;
        }
        fs::rename(&slots.staging, &slots.target)?;
        info!("installed hatch package {} into {}", dependency.name, slots.target.display());

        Ok(Installed::new(
            dependency.resolved_version.clone(),
            Some(slots.target.display().to_string()),
        ))
    }

    fn uninstall(
        &self,
        dependency: &Dependency,
        ctx: &InstallContext,
    ) -> Result<(), InstallerError> {
        let slots = self.slots(&dependency.name)?;
        if ctx.simulation() {
            ctx.progress(None, format!("would remove {}", slots.target.display()));
            return Ok(());
        }
        for dir in [&slots.staging, &slots.target] {
            if dir.exists() {
                debug!("removing {}", dir.display());
                fs::remove_dir_all(dir)?;
            }
        }
        if slots.previous.exists() {
            fs::rename(&slots.previous, &slots.target)?;
            info!("restored previous {} into {}", dependency.name, slots.target.display());
        }
        Ok(())
    }

    fn commit(&self, dependency: &Dependency, ctx: &InstallContext) -> Result<(), InstallerError> {
        let slots = self.slots(&dependency.name)?;
        if !ctx.simulation() && slots.previous.exists() {
            debug!("dropping {}", slots.previous.display());
            fs::remove_dir_all(&slots.previous)?;
        }
        Ok(())
    }
}

fn copy_tree(from: &Path, to: &Path, ctx: &InstallContext) -> Result<(), InstallerError> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            ctx.check()?;
            copy_tree(&src, &dst, ctx)?;
        } else if file_type.is_file() {
            fs::copy(&src, &dst)?;
        }
    }
    Ok(())
}

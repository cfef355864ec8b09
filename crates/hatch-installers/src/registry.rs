use crate::installer::{BackendConfig, Installer};
use crate::mock::MockInstaller;
use crate::InstallerError;
use hatch_schema::DependencyKind;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

type Factory = Box<dyn Fn() -> Arc<dyn Installer> + Send + Sync>;

struct Entry {
    factory: Factory,
    instance: OnceLock<Arc<dyn Installer>>,
}

/// Write-once-per-kind mapping from dependency kind to installer.
///
/// Factories run lazily on first `resolve`; the produced instance is then
/// reused for the lifetime of the registry.
#[derive(Default)]
pub struct InstallerRegistry {
    entries: HashMap<DependencyKind, Entry>,
}

impl InstallerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: DependencyKind, factory: F) -> Result<(), InstallerError>
    where
        F: Fn() -> Arc<dyn Installer> + Send + Sync + 'static,
    {
        if self.entries.contains_key(&kind) {
            return Err(InstallerError::DuplicateRegistration(kind));
        }
        debug!("registered installer for {kind}");
        self.entries.insert(
            kind,
            Entry {
                factory: Box::new(factory),
                instance: OnceLock::new(),
            },
        );
        Ok(())
    }

    /// Register an already constructed installer.
    pub fn register_instance(
        &mut self,
        kind: DependencyKind,
        installer: Arc<dyn Installer>,
    ) -> Result<(), InstallerError> {
        self.register(kind, move || Arc::clone(&installer))
    }

    pub fn resolve(&self, kind: DependencyKind) -> Result<Arc<dyn Installer>, InstallerError> {
        let entry = self
            .entries
            .get(&kind)
            .ok_or(InstallerError::NotFound(kind))?;
        Ok(Arc::clone(entry.instance.get_or_init(|| (entry.factory)())))
    }

    pub fn contains(&self, kind: DependencyKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// Registered kinds in stage order.
    pub fn kinds(&self) -> Vec<DependencyKind> {
        DependencyKind::STAGE_ORDER
            .into_iter()
            .filter(|k| self.entries.contains_key(k))
            .collect()
    }
}

/// Build a registry with every kind bound to the named backend family.
///
/// `system` wires pip, apt, docker and local hatch packages; `mock` binds
/// one shared [`MockInstaller`] to all four kinds.
pub fn select_backends(
    name: &str,
    config: &BackendConfig,
) -> Result<InstallerRegistry, InstallerError> {
    let mut registry = InstallerRegistry::new();
    match name {
        "system" => {
            let c = config.clone();
            registry.register(DependencyKind::System, move || {
                Arc::new(crate::apt::AptInstaller::new(&c))
            })?;
            let c = config.clone();
            registry.register(DependencyKind::Runtime, move || {
                Arc::new(crate::pip::PipInstaller::new(&c))
            })?;
            let c = config.clone();
            registry.register(DependencyKind::Package, move || {
                Arc::new(crate::package::HatchPackageInstaller::new(&c))
            })?;
            let c = config.clone();
            registry.register(DependencyKind::Container, move || {
                Arc::new(crate::docker::DockerInstaller::new(&c))
            })?;
        }
        "mock" => {
            let mock: Arc<dyn Installer> = Arc::new(MockInstaller::new());
            for kind in DependencyKind::STAGE_ORDER {
                registry.register_instance(kind, Arc::clone(&mock))?;
            }
        }
        other => return Err(InstallerError::BackendUnavailable(other.to_owned())),
    }
    Ok(registry)
}

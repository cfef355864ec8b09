use hatch_installers::{version_satisfies, PackageSource};
use hatch_schema::{
    parse_declaration_file, DeclaredDependency, Dependency, DependencyKind, PackageDeclaration,
    PlanError,
};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("no version of package '{name}' satisfies '{constraint}'")]
    Unresolved { name: String, constraint: String },
    #[error("package dependency cycle: {0}")]
    Cycle(String),
    #[error("failed to read declaration of '{name}': {reason}")]
    Declaration { name: String, reason: String },
}

/// Turns a package declaration into a flat, resolved dependency list.
///
/// Implementations must return `package`-kind entries topologically sorted
/// (dependencies before dependents), each with a resolved version.
pub trait Resolver: Send + Sync {
    fn resolve(&self, declaration: &PackageDeclaration) -> Result<Vec<Dependency>, ResolveError>;
}

/// Resolves directly from the declaration, consulting a local package
/// source for package versions and their transitive package dependencies.
#[derive(Debug, Clone, Default)]
pub struct DeclarationResolver {
    source: Option<PackageSource>,
}

impl DeclarationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_source(mut self, source: PackageSource) -> Self {
        self.source = Some(source);
        self
    }

    fn resolve_version(&self, entry: &DeclaredDependency) -> Result<String, ResolveError> {
        if let Some(v) = entry.resolved_version.as_deref().filter(|v| !v.trim().is_empty()) {
            return Ok(v.trim().to_owned());
        }
        let probe = Dependency::new(DependencyKind::Package, &entry.name)
            .with_constraint(entry.version_constraint.clone().unwrap_or_default());
        if let Some(pinned) = probe.pinned_version() {
            return Ok(pinned.to_owned());
        }

        let constraint = entry.version_constraint.as_deref();
        self.source
            .as_ref()
            .and_then(|s| highest_matching(s.available_versions(&entry.name), constraint))
            .ok_or_else(|| ResolveError::Unresolved {
                name: entry.name.clone(),
                constraint: constraint.unwrap_or("*").to_owned(),
            })
    }

    /// Depth-first walk emitting each package after its own package
    /// dependencies.
    fn visit(
        &self,
        entry: &DeclaredDependency,
        stack: &mut Vec<String>,
        seen: &mut HashSet<String>,
        out: &mut Vec<Dependency>,
    ) -> Result<(), ResolveError> {
        if stack.contains(&entry.name) {
            stack.push(entry.name.clone());
            return Err(ResolveError::Cycle(stack.join(" -> ")));
        }
        if seen.contains(&entry.name) {
            return Ok(());
        }

        let version = self.resolve_version(entry)?;
        stack.push(entry.name.clone());

        if let Some(dir) = self
            .source
            .as_ref()
            .and_then(|s| s.locate(&entry.name, &version))
        {
            let nested = parse_declaration_file(&dir).map_err(|e| ResolveError::Declaration {
                name: entry.name.clone(),
                reason: e.to_string(),
            })?;
            for (kind, child) in nested.declared_dependencies()? {
                if kind == DependencyKind::Package {
                    self.visit(&child, stack, seen, out)?;
                }
            }
        }

        stack.pop();
        seen.insert(entry.name.clone());
        debug!("resolved package {} to {version}", entry.name);
        out.push(to_dependency(DependencyKind::Package, entry).with_resolved_version(version));
        Ok(())
    }
}

impl Resolver for DeclarationResolver {
    fn resolve(&self, declaration: &PackageDeclaration) -> Result<Vec<Dependency>, ResolveError> {
        let declared = declaration.declared_dependencies()?;
        let mut out = Vec::new();
        let mut stack = vec![declaration.name.clone()];
        let mut seen = HashSet::new();

        for (kind, entry) in &declared {
            if *kind == DependencyKind::Package {
                self.visit(entry, &mut stack, &mut seen, &mut out)?;
            } else {
                out.push(to_dependency(*kind, entry));
            }
        }
        Ok(out)
    }
}

fn to_dependency(kind: DependencyKind, entry: &DeclaredDependency) -> Dependency {
    Dependency {
        kind,
        name: entry.name.clone(),
        version_constraint: entry.version_constraint.clone(),
        resolved_version: entry.resolved_version.clone(),
        backend_hint: entry.backend_hint().map(str::to_owned),
        after: entry.after.clone(),
    }
}

fn parse_padded(version: &str) -> Option<semver::Version> {
    let mut parts: Vec<&str> = version.trim().split('.').collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    semver::Version::parse(&parts.join(".")).ok()
}

fn highest_matching(versions: Vec<String>, constraint: Option<&str>) -> Option<String> {
    versions
        .into_iter()
        .filter(|v| version_satisfies(v, constraint))
        .filter_map(|v| parse_padded(&v).map(|parsed| (parsed, v)))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, v)| v)
}

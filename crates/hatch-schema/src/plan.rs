use crate::dependency::{Dependency, DependencyKind};
use crate::types::{DependencyKey, PlanFingerprint};
use crate::PlanError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

/// The dependencies of one kind. Members are parallel-eligible unless
/// linked by an `after` edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    kind: DependencyKind,
    dependencies: Vec<Dependency>,
}

impl Stage {
    fn empty(kind: DependencyKind) -> Self {
        Self {
            kind,
            dependencies: Vec::new(),
        }
    }

    pub fn kind(&self) -> DependencyKind {
        self.kind
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Members with no `after` edge, in declaration order. These may all
    /// start as soon as the stage opens.
    pub fn roots(&self) -> Vec<&Dependency> {
        self.dependencies
            .iter()
            .filter(|d| d.after.is_none())
            .collect()
    }

    /// Members whose `after` edge names `name`, in declaration order.
    /// Siblings sharing a predecessor are independent of each other.
    pub fn successors(&self, name: &str) -> Vec<&Dependency> {
        self.dependencies
            .iter()
            .filter(|d| d.after.as_deref() == Some(name))
            .collect()
    }
}

/// The full set of stages for one installation request.
///
/// Always holds exactly four stages in [`DependencyKind::STAGE_ORDER`],
/// some of which may be empty. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationPlan {
    package: String,
    stages: Vec<Stage>,
}

impl InstallationPlan {
    /// Bucket already-resolved dependencies into the four fixed stages.
    ///
    /// Order inside a stage follows input order, so a resolver's
    /// topological ordering of `package` dependencies survives.
    pub fn build(
        package: impl Into<String>,
        dependencies: impl IntoIterator<Item = Dependency>,
    ) -> Result<Self, PlanError> {
        let mut stages: Vec<Stage> = DependencyKind::STAGE_ORDER
            .iter()
            .map(|k| Stage::empty(*k))
            .collect();
        let mut seen: HashSet<DependencyKey> = HashSet::new();

        for dep in dependencies {
            validate_name(&dep)?;
            if dep.kind == DependencyKind::Package
                && dep
                    .resolved_version
                    .as_deref()
                    .is_none_or(|v| v.trim().is_empty())
            {
                return Err(PlanError::MissingResolvedVersion(dep.name));
            }
            if !seen.insert(dep.key()) {
                return Err(PlanError::Duplicate(dep.key().into_inner()));
            }
            stages[dep.kind.stage_index()].dependencies.push(dep);
        }

        for stage in &stages {
            validate_edges(stage)?;
        }

        Ok(Self {
            package: package.into(),
            stages,
        })
    }

    /// Re-check the invariants [`InstallationPlan::build`] enforces.
    ///
    /// Plans can arrive deserialized from disk, so execution calls this
    /// before scheduling anything.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.stages.len() != DependencyKind::STAGE_ORDER.len() {
            return Err(PlanError::InvalidSection {
                section: "stages".to_owned(),
                reason: format!("expected {} stages", DependencyKind::STAGE_ORDER.len()),
            });
        }
        let mut seen: HashSet<DependencyKey> = HashSet::new();
        for (stage, kind) in self.stages.iter().zip(DependencyKind::STAGE_ORDER) {
            if stage.kind != kind {
                return Err(PlanError::InvalidSection {
                    section: stage.kind.to_string(),
                    reason: format!("stage out of order, expected {kind}"),
                });
            }
            for dep in &stage.dependencies {
                validate_name(dep)?;
                if dep.kind != kind {
                    return Err(PlanError::InvalidSection {
                        section: kind.to_string(),
                        reason: format!("holds {} dependency '{}'", dep.kind, dep.name),
                    });
                }
                if !seen.insert(dep.key()) {
                    return Err(PlanError::Duplicate(dep.key().into_inner()));
                }
            }
            validate_edges(stage)?;
        }
        Ok(())
    }

    /// Name of the package this plan installs dependencies for.
    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, kind: DependencyKind) -> &Stage {
        &self.stages[kind.stage_index()]
    }

    /// All dependencies in stage order.
    pub fn dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.stages.iter().flat_map(|s| s.dependencies.iter())
    }

    pub fn len(&self) -> usize {
        self.stages.iter().map(Stage::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn canonical_json(&self) -> Result<String, PlanError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn fingerprint(&self) -> Result<PlanFingerprint, PlanError> {
        let json = self.canonical_json()?;
        Ok(PlanFingerprint::new(
            blake3::hash(json.as_bytes()).to_hex().to_string(),
        ))
    }

    /// Human-readable description, used for consent prompts and previews.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Installation plan for '{}' ({} dependencies):\n",
            self.package,
            self.len()
        );
        for stage in self.stages.iter().filter(|s| !s.is_empty()) {
            let _ = writeln!(out, "  {} ({}):", stage.kind, stage.len());
            for dep in &stage.dependencies {
                let _ = write!(out, "    - {}", dep.requirement());
                if let Some(v) = &dep.resolved_version {
                    let _ = write!(out, " -> {v}");
                }
                if let Some(a) = &dep.after {
                    let _ = write!(out, " (after {a})");
                }
                out.push('\n');
            }
        }
        out
    }
}

/// Names end up in installer argv and in environment paths, so they must
/// be a single plain token.
fn validate_name(dep: &Dependency) -> Result<(), PlanError> {
    let name = dep.name.as_str();
    if name.trim().is_empty() {
        return Err(PlanError::EmptyName(dep.kind));
    }
    let reason = if name.starts_with('-') {
        Some("must not start with '-'")
    } else if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        Some("must not contain whitespace or control characters")
    } else if name.contains('\\') {
        Some("must not contain '\\'")
    } else if name.contains("..") {
        Some("must not contain '..'")
    } else if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        Some("must not start, end or repeat '/'")
    } else if name.contains('/') && dep.kind != DependencyKind::Container {
        // Image references such as `org/app` are the only nested names.
        Some("must not contain '/'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(PlanError::InvalidName {
            kind: dep.kind,
            name: name.to_owned(),
            reason,
        }),
        None => Ok(()),
    }
}

fn validate_edges(stage: &Stage) -> Result<(), PlanError> {
    let after: HashMap<&str, Option<&str>> = stage
        .dependencies
        .iter()
        .map(|d| (d.name.as_str(), d.after.as_deref()))
        .collect();

    for dep in &stage.dependencies {
        let Some(pred) = dep.after.as_deref() else {
            continue;
        };
        if !after.contains_key(pred) {
            return Err(PlanError::DanglingPredecessor {
                dependency: dep.key().into_inner(),
                predecessor: pred.to_owned(),
            });
        }
        let mut visited: HashSet<&str> = HashSet::from([dep.name.as_str()]);
        let mut cursor = Some(pred);
        while let Some(name) = cursor {
            if !visited.insert(name) {
                return Err(PlanError::PredecessorCycle(dep.key().into_inner()));
            }
            cursor = after.get(name).copied().flatten();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(name: &str) -> Dependency {
        Dependency::new(DependencyKind::Runtime, name)
    }

    #[test]
    fn plan_always_has_four_ordered_stages() {
        let plan = InstallationPlan::build("pkg", vec![runtime("requests")]).unwrap();
        let kinds: Vec<_> = plan.stages().iter().map(Stage::kind).collect();
        assert_eq!(kinds, DependencyKind::STAGE_ORDER.to_vec());
        assert_eq!(plan.len(), 1);
        assert!(plan.stage(DependencyKind::System).is_empty());
        assert_eq!(plan.stage(DependencyKind::Runtime).len(), 1);
    }

    #[test]
    fn dependencies_bucket_by_kind() {
        let plan = InstallationPlan::build(
            "pkg",
            vec![
                Dependency::new(DependencyKind::Container, "redis"),
                runtime("flask"),
                Dependency::new(DependencyKind::System, "curl"),
                Dependency::new(DependencyKind::Package, "base_pkg").with_resolved_version("1.0.3"),
            ],
        )
        .unwrap();
        let names: Vec<_> = plan.dependencies().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["curl", "flask", "base_pkg", "redis"]);
    }

    #[test]
    fn package_without_resolved_version_fails() {
        let err = InstallationPlan::build(
            "pkg",
            vec![Dependency::new(DependencyKind::Package, "base_pkg").with_constraint(">=1.0.0")],
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::MissingResolvedVersion(n) if n == "base_pkg"));
    }

    #[test]
    fn non_package_kinds_may_omit_resolved_version() {
        assert!(InstallationPlan::build("pkg", vec![runtime("requests")]).is_ok());
    }

    #[test]
    fn duplicate_dependency_fails() {
        let err = InstallationPlan::build("pkg", vec![runtime("flask"), runtime("flask")]).unwrap_err();
        assert!(matches!(err, PlanError::Duplicate(k) if k == "runtime:flask"));
    }

    #[test]
    fn same_name_in_different_stages_is_allowed() {
        let plan = InstallationPlan::build(
            "pkg",
            vec![runtime("redis"), Dependency::new(DependencyKind::Container, "redis")],
        )
        .unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn empty_name_fails() {
        assert!(matches!(
            InstallationPlan::build("pkg", vec![runtime(" ")]),
            Err(PlanError::EmptyName(DependencyKind::Runtime))
        ));
    }

    #[test]
    fn dangling_predecessor_fails() {
        let err =
            InstallationPlan::build("pkg", vec![runtime("b").with_after("missing")]).unwrap_err();
        assert!(matches!(err, PlanError::DanglingPredecessor { .. }));
    }

    #[test]
    fn predecessor_in_other_stage_is_dangling() {
        let err = InstallationPlan::build(
            "pkg",
            vec![
                Dependency::new(DependencyKind::System, "curl"),
                runtime("pycurl").with_after("curl"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::DanglingPredecessor { .. }));
    }

    #[test]
    fn predecessor_cycle_fails() {
        let err = InstallationPlan::build(
            "pkg",
            vec![runtime("a").with_after("b"), runtime("b").with_after("a")],
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::PredecessorCycle(_)));

        let self_loop = InstallationPlan::build("pkg", vec![runtime("a").with_after("a")]);
        assert!(matches!(self_loop, Err(PlanError::PredecessorCycle(_))));
    }

    #[test]
    fn independent_dependencies_are_all_roots() {
        let plan =
            InstallationPlan::build("pkg", vec![runtime("numpy"), runtime("pandas")]).unwrap();
        let stage = plan.stage(DependencyKind::Runtime);
        let roots: Vec<_> = stage.roots().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(roots, ["numpy", "pandas"]);
        assert!(stage.successors("numpy").is_empty());
    }

    #[test]
    fn siblings_sharing_a_predecessor_are_separate_successors() {
        let plan = InstallationPlan::build(
            "pkg",
            vec![
                runtime("c").with_after("a"),
                runtime("solo"),
                runtime("b").with_after("a"),
                runtime("a"),
                runtime("d").with_after("b"),
            ],
        )
        .unwrap();
        let stage = plan.stage(DependencyKind::Runtime);
        let names = |deps: Vec<&Dependency>| -> Vec<String> {
            deps.into_iter().map(|d| d.name.clone()).collect()
        };
        assert_eq!(names(stage.roots()), ["solo", "a"]);
        assert_eq!(names(stage.successors("a")), ["c", "b"]);
        assert_eq!(names(stage.successors("b")), ["d"]);
        assert!(stage.successors("c").is_empty());
    }

    #[test]
    fn names_that_escape_paths_or_read_as_options_fail() {
        for bad in ["../victim", "a/../b", "..", "--index-url=http://x", "-e", "a b", "a\nb", "a\\b", "x\u{7}"] {
            let err = InstallationPlan::build("pkg", vec![runtime(bad)]).unwrap_err();
            assert!(
                matches!(&err, PlanError::InvalidName { name, .. } if name == bad),
                "{bad:?} gave {err}"
            );
        }
        let nested = Dependency::new(DependencyKind::System, "usr/bin");
        assert!(matches!(
            InstallationPlan::build("pkg", vec![nested]),
            Err(PlanError::InvalidName { .. })
        ));
    }

    #[test]
    fn image_references_may_nest() {
        let plan = InstallationPlan::build(
            "pkg",
            vec![Dependency::new(DependencyKind::Container, "org/app")],
        );
        assert!(plan.is_ok());
        for bad in ["/org/app", "org//app", "org/"] {
            let dep = Dependency::new(DependencyKind::Container, bad);
            assert!(matches!(
                InstallationPlan::build("pkg", vec![dep]),
                Err(PlanError::InvalidName { .. })
            ));
        }
    }

    #[test]
    fn validate_rejects_a_tampered_plan() {
        let plan = InstallationPlan::build("pkg", vec![runtime("a"), runtime("b").with_after("a")])
            .unwrap();
        assert!(plan.validate().is_ok());

        let json = plan
            .canonical_json()
            .unwrap()
            .replace("\"after\":\"a\"", "\"after\":\"b\"");
        let tampered: InstallationPlan = serde_json::from_str(&json).unwrap();
        assert!(matches!(tampered.validate(), Err(PlanError::PredecessorCycle(_))));
    }

    #[test]
    fn identical_inputs_produce_identical_plans_and_fingerprints() {
        let deps = vec![runtime("requests").with_constraint(">=2.28.0")];
        let preview = InstallationPlan::build("pkg", deps.clone()).unwrap();
        let executed = InstallationPlan::build("pkg", deps).unwrap();
        assert_eq!(preview, executed);
        assert_eq!(preview.fingerprint().unwrap(), executed.fingerprint().unwrap());
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = InstallationPlan::build("pkg", vec![runtime("flask")]).unwrap();
        let b = InstallationPlan::build("pkg", vec![runtime("django")]).unwrap();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn summary_lists_non_empty_stages() {
        let plan = InstallationPlan::build(
            "demo",
            vec![
                runtime("requests").with_constraint(">=2.28.0"),
                Dependency::new(DependencyKind::Package, "base_pkg").with_resolved_version("1.0.3"),
            ],
        )
        .unwrap();
        let s = plan.summary();
        assert!(s.contains("'demo'"));
        assert!(s.contains("runtime (1)"));
        assert!(s.contains("requests>=2.28.0"));
        assert!(s.contains("base_pkg -> 1.0.3"));
        assert!(!s.contains("system"));
    }
}

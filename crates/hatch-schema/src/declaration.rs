use crate::dependency::DependencyKind;
use crate::PlanError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the package declaration inside a package directory.
pub const DECLARATION_FILE: &str = "hatch_metadata.json";

const SECTION_SUFFIX: &str = "_dependencies";

#[derive(Debug, Error)]
pub enum DeclarationError {
    #[error("failed to read package declaration {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse package declaration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("package name must not be empty")]
    EmptyName,
}

/// Parsed `hatch_metadata.json`.
///
/// Dependency sections are any top-level `<kind>_dependencies` arrays;
/// all other unrecognized fields (author, license, tags...) are kept
/// verbatim in `extra` and otherwise ignored.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PackageDeclaration {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One entry of a `<kind>_dependencies` array.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeclaredDependency {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_constraint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl DeclaredDependency {
    pub fn backend_hint(&self) -> Option<&str> {
        self.package_manager.as_deref().or(self.registry.as_deref())
    }
}

fn default_version() -> String {
    "0.0.0".to_owned()
}

impl PackageDeclaration {
    /// Extract every declared dependency, tagged with its kind.
    ///
    /// Sections are visited in key order and entries keep their declared
    /// order within a section. An unrecognized section prefix or an
    /// entry that is not a valid dependency object fails.
    pub fn declared_dependencies(&self) -> Result<Vec<(DependencyKind, DeclaredDependency)>, PlanError> {
        let mut out = Vec::new();
        for (key, value) in &self.extra {
            let Some(prefix) = key.strip_suffix(SECTION_SUFFIX) else {
                continue;
            };
            let kind: DependencyKind = prefix.parse()?;
            let entries: Vec<DeclaredDependency> = serde_json::from_value(value.clone())
                .map_err(|e| PlanError::InvalidSection {
                    section: key.clone(),
                    reason: e.to_string(),
                })?;
            out.extend(entries.into_iter().map(|d| (kind, d)));
        }
        Ok(out)
    }
}

pub fn parse_declaration_str(input: &str) -> Result<PackageDeclaration, DeclarationError> {
    let decl: PackageDeclaration = serde_json::from_str(input)?;
    if decl.name.trim().is_empty() {
        return Err(DeclarationError::EmptyName);
    }
    Ok(decl)
}

/// Read a declaration from a file, or from `<dir>/hatch_metadata.json`
/// when `path` is a package directory.
pub fn parse_declaration_file(path: impl AsRef<Path>) -> Result<PackageDeclaration, DeclarationError> {
    let path = path.as_ref();
    let file = if path.is_dir() {
        path.join(DECLARATION_FILE)
    } else {
        path.to_path_buf()
    };
    let content = fs::read_to_string(&file).map_err(|source| DeclarationError::Io {
        path: file.clone(),
        source,
    })?;
    parse_declaration_str(&content)
}

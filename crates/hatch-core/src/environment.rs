use crate::concurrency::StoreLock;
use crate::report::ManifestEntry;
use crate::CoreError;
use hatch_schema::DependencyKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const ENVIRONMENTS_FILE: &str = "environments.json";
const LOCK_FILE: &str = "environments.lock";

/// A dependency recorded as installed into an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRecord {
    pub name: String,
    pub kind: DependencyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub installed_at: String,
}

/// Persists what a completed installation left behind.
pub trait EnvironmentStore: Send + Sync {
    fn record_installed(&self, environment: &str, entry: &ManifestEntry) -> Result<(), CoreError>;

    fn installed(&self, environment: &str) -> Result<Vec<InstalledRecord>, CoreError>;

    fn record_manifest(&self, environment: &str, manifest: &[ManifestEntry]) -> Result<(), CoreError> {
        for entry in manifest {
            self.record_installed(environment, entry)?;
        }
        Ok(())
    }
}

pub fn validate_env_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() || name.len() > 64 {
        return Err(CoreError::InvalidEnvironmentName(format!(
            "'{name}' must be 1-64 characters"
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(CoreError::InvalidEnvironmentName(format!(
            "'{name}' must match [a-zA-Z0-9_-]"
        )));
    }
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EnvironmentsFile {
    #[serde(default)]
    environments: BTreeMap<String, Vec<InstalledRecord>>,
}

/// `environments.json` under the hatch home, rewritten atomically while
/// holding an exclusive file lock.
#[derive(Debug, Clone)]
pub struct JsonEnvironmentStore {
    root: PathBuf,
}

impl JsonEnvironmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory hatch packages for `environment` are installed into.
    pub fn environment_dir(&self, environment: &str) -> PathBuf {
        self.root.join("envs").join(environment)
    }

    pub fn environments(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.read()?.environments.into_keys().collect())
    }

    /// Lock file serializing writers of `environments.json`.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    fn file_path(&self) -> PathBuf {
        self.root.join(ENVIRONMENTS_FILE)
    }

    fn read(&self) -> Result<EnvironmentsFile, CoreError> {
        match fs::read_to_string(self.file_path()) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EnvironmentsFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, data: &EnvironmentsFile) -> Result<(), CoreError> {
        fs::create_dir_all(&self.root)?;
        let content = serde_json::to_string_pretty(data)?;
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.file_path()).map_err(|e| CoreError::Io(e.error))?;
        fs::File::open(&self.root)?.sync_all()?;
        Ok(())
    }

    fn update(
        &self,
        environment: &str,
        apply: impl FnOnce(&mut Vec<InstalledRecord>),
    ) -> Result<(), CoreError> {
        validate_env_name(environment)?;
        let _lock = StoreLock::acquire(&self.lock_path())?;
        let mut data = self.read()?;
        apply(data.environments.entry(environment.to_owned()).or_default());
        self.write(&data)
    }
}

fn upsert(records: &mut Vec<InstalledRecord>, entry: &ManifestEntry, installed_at: &str) {
    let record = InstalledRecord {
        name: entry.name.clone(),
        kind: entry.kind,
        version: entry.version.clone(),
        location: entry.location.clone(),
        installed_at: installed_at.to_owned(),
    };
    match records
        .iter_mut()
        .find(|r| r.kind == entry.kind && r.name == entry.name)
    {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
}

impl EnvironmentStore for JsonEnvironmentStore {
    fn record_installed(&self, environment: &str, entry: &ManifestEntry) -> Result<(), CoreError> {
        self.record_manifest(environment, std::slice::from_ref(entry))
    }

    fn record_manifest(&self, environment: &str, manifest: &[ManifestEntry]) -> Result<(), CoreError> {
        let now = chrono::Utc::now().to_rfc3339();
        self.update(environment, |records| {
            for entry in manifest {
                upsert(records, entry, &now);
            }
        })?;
        debug!("recorded {} entries in environment '{environment}'", manifest.len());
        Ok(())
    }

    fn installed(&self, environment: &str) -> Result<Vec<InstalledRecord>, CoreError> {
        validate_env_name(environment)?;
        self.read()?
            .environments
            .remove(environment)
            .ok_or_else(|| CoreError::EnvironmentNotFound(environment.to_owned()))
    }
}

use crate::CoreError;
use hatch_installers::BackendConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the directory holding config, environments and packages.
pub const HOME_ENV: &str = "HATCH_HOME";
/// Overrides the configured installer backend (`system` or `mock`).
pub const BACKEND_ENV: &str = "HATCH_INSTALLER_BACKEND";

const CONFIG_FILE: &str = "config.toml";
const DEFAULT_BACKEND: &str = "system";

/// `$HATCH_HOME`, or `~/.hatch`.
pub fn hatch_home() -> Result<PathBuf, CoreError> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    let home = std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CoreError::Config("neither HATCH_HOME nor HOME is set".to_owned()))?;
    Ok(PathBuf::from(home).join(".hatch"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HatchConfig {
    /// Worker limit per stage; unset runs every group of a stage at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apt_get: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_source: Option<PathBuf>,
}

impl HatchConfig {
    /// Read `config.toml` from the hatch home; defaults when absent.
    pub fn load_from_home(home: &Path) -> Result<Self, CoreError> {
        Self::load(&home.join(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let config: Self = toml::from_str(&content)
            .map_err(|e| CoreError::Config(format!("invalid {}: {e}", path.display())))?;
        if config.concurrency == Some(0) {
            return Err(CoreError::Config("concurrency must be at least 1".to_owned()));
        }
        Ok(config)
    }

    /// Backend name, with `env_override` (normally `HATCH_INSTALLER_BACKEND`)
    /// taking precedence over the file.
    pub fn backend_name(&self, env_override: Option<&str>) -> String {
        env_override
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or(self.backend.as_deref())
            .unwrap_or(DEFAULT_BACKEND)
            .to_owned()
    }

    pub fn dependency_timeout(&self) -> Option<Duration> {
        self.dependency_timeout_secs.map(Duration::from_secs)
    }

    pub fn backend_config(&self, environment_dir: impl Into<PathBuf>) -> BackendConfig {
        let mut config = BackendConfig::new(environment_dir);
        if let Some(python) = &self.python {
            config.python.clone_from(python);
        }
        if let Some(apt_get) = &self.apt_get {
            config.apt_get.clone_from(apt_get);
        }
        if let Some(docker) = &self.docker {
            config.docker.clone_from(docker);
        }
        config.package_source.clone_from(&self.package_source);
        config
    }
}

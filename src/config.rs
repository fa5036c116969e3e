//! TOML-backed config loading: `build`/`plan`/`doctor`/`migrate-fingerprints`
//! all take an optional config path, with CLI flags layered on top.

use crate::planner::PropagationPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("maxWorkers must be >= 1, got {0}")]
    InvalidMaxWorkers(usize),
}

/// Every tunable the CLI surface exposes: where builds happen, where the
/// ports tree and database live, worker/timeout knobs, and the host
/// collaborators (`portMetadataTool`, `isolationHelper`, `propagationPolicy`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub build_base: PathBuf,
    pub ports_dir: PathBuf,
    pub db_path: Option<PathBuf>,
    pub max_workers: usize,
    pub slow_start_ms: u64,
    pub use_isolation_backend: String,
    pub cancel_grace_secs: u64,
    pub per_execute_timeout_secs: u64,
    pub port_metadata_tool: String,
    pub isolation_helper: Option<String>,
    pub propagation_policy: PropagationPolicyConfig,
    pub build_command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropagationPolicyConfig {
    None,
    LibBuildOnly,
}

impl From<PropagationPolicyConfig> for PropagationPolicy {
    fn from(value: PropagationPolicyConfig) -> Self {
        match value {
            PropagationPolicyConfig::None => PropagationPolicy::None,
            PropagationPolicyConfig::LibBuildOnly => PropagationPolicy::LibBuildOnly,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            build_base: PathBuf::from("/var/portwright"),
            ports_dir: PathBuf::from("/usr/ports"),
            db_path: None,
            max_workers: 4,
            slow_start_ms: 0,
            use_isolation_backend: "process".to_string(),
            cancel_grace_secs: 30,
            per_execute_timeout_secs: 0,
            port_metadata_tool: "make".to_string(),
            isolation_helper: None,
            propagation_policy: PropagationPolicyConfig::LibBuildOnly,
            build_command: "port-build".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidMaxWorkers(self.max_workers));
        }
        Ok(())
    }

    /// `dbPath` defaults to `{buildBase}/builds.db` when unset.
    pub fn effective_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.build_base.join("builds.db"))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    /// Zero means "no timeout".
    pub fn per_execute_timeout(&self) -> Option<Duration> {
        if self.per_execute_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.per_execute_timeout_secs))
        }
    }

    pub fn slow_start(&self) -> Duration {
        Duration::from_millis(self.slow_start_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = Config::default();
        assert!(config.max_workers >= 1);
        assert_eq!(config.per_execute_timeout(), None);
        assert_eq!(
            config.effective_db_path(),
            config.build_base.join("builds.db")
        );
    }

    #[test]
    fn parses_toml_and_overrides_defaults() {
        let toml_text = r#"
            build_base = "/tmp/portwright-build"
            ports_dir = "/usr/ports"
            max_workers = 8
            use_isolation_backend = "mock"
            propagation_policy = "none"
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portwright.toml");
        std::fs::write(&path, toml_text).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.use_isolation_backend, "mock");
        assert_eq!(config.propagation_policy, PropagationPolicyConfig::None);
    }

    #[test]
    fn rejects_zero_max_workers() {
        let toml_text = "max_workers = 0\n";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portwright.toml");
        std::fs::write(&path, toml_text).unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMaxWorkers(0)));
    }
}

//! Engine configuration loaded from `statewright.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! `STATEWRIGHT_WORKERS` and `STATEWRIGHT_LOG` take precedence over the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

pub const CONFIG_FILE: &str = "statewright.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Units the local job system runs at the same time.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Reconcile installed tasks with stored task definitions when the
    /// engine starts.
    #[serde(default = "default_auto_reconcile")]
    pub auto_reconcile: bool,

    /// `tracing_subscriber::EnvFilter` directive.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub json_logs: bool,
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_auto_reconcile() -> bool {
    true
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: default_worker_concurrency(),
            auto_reconcile: default_auto_reconcile(),
            log_filter: default_log_filter(),
            json_logs: false,
        }
    }
}

impl EngineConfig {
    /// Loads `statewright.toml` from the current directory, or defaults if it
    /// does not exist.
    pub fn load() -> Result<Self> {
        let path = Path::new(CONFIG_FILE);
        let config = if path.exists() {
            Self::read(path)?
        } else {
            Self::default()
        };
        Ok(config.with_env_overrides())
    }

    /// Loads an explicit file. Unlike [`EngineConfig::load`], a missing file
    /// is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        Ok(Self::read(path)?.with_env_overrides())
    }

    fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = toml::from_str::<EngineConfig>(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    fn with_env_overrides(self) -> Self {
        self.apply_overrides(
            std::env::var("STATEWRIGHT_WORKERS").ok().as_deref(),
            std::env::var("STATEWRIGHT_LOG").ok().as_deref(),
        )
    }

    fn apply_overrides(mut self, workers: Option<&str>, log: Option<&str>) -> Self {
        if let Some(workers) = workers
            && let Ok(n) = workers.trim().parse::<usize>()
            && n > 0
        {
            self.worker_concurrency = n;
        }
        if let Some(filter) = log
            && !filter.is_empty()
        {
            self.log_filter = filter.to_string();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_concurrency, 4);
        assert!(config.auto_reconcile);
        assert_eq!(config.log_filter, "info");
        assert!(!config.json_logs);
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            worker_concurrency = 8
            json_logs = true
        "#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.worker_concurrency, 8);
        assert!(config.json_logs);
        assert!(config.auto_reconcile);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn load_from_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "auto_reconcile = false").unwrap();
        writeln!(file, "log_filter = \"statewright=debug\"").unwrap();
        let config = EngineConfig::read(file.path()).unwrap();
        assert!(!config.auto_reconcile);
        assert_eq!(config.log_filter, "statewright=debug");
    }

    #[test]
    fn load_from_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineConfig::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }

    #[test]
    fn overrides_take_precedence() {
        let config = EngineConfig::default().apply_overrides(Some("16"), Some("debug"));
        assert_eq!(config.worker_concurrency, 16);
        assert_eq!(config.log_filter, "debug");

        let ignored = EngineConfig::default().apply_overrides(Some("zero"), Some(""));
        assert_eq!(ignored.worker_concurrency, 4);
        assert_eq!(ignored.log_filter, "info");

        let zero = EngineConfig::default().apply_overrides(Some("0"), None);
        assert_eq!(zero.worker_concurrency, 4);
    }
}

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::store::DEFAULT_BUSY_TIMEOUT;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PluginConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub migration: MigrationSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StoreSection {
    pub db_path: Option<String>,
    pub busy_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct MigrationSection {
    #[serde(default = "default_run_on_init")]
    pub run_on_init: bool,
}

impl Default for MigrationSection {
    fn default() -> Self {
        Self {
            run_on_init: default_run_on_init(),
        }
    }
}

fn default_run_on_init() -> bool {
    true
}

impl PluginConfig {
    /// Resolve the sqlite busy timeout: env STRUCT_BUSY_TIMEOUT_SECS > config > default.
    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout_with_lookup(|key| env::var(key).ok())
    }

    fn busy_timeout_with_lookup<F>(&self, lookup_env: F) -> Duration
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup_env("STRUCT_BUSY_TIMEOUT_SECS")
            && let Ok(secs) = value.trim().parse::<u64>()
        {
            return Duration::from_secs(secs);
        }
        self.store
            .busy_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_BUSY_TIMEOUT)
    }

    /// Configured database path, ignoring blank values.
    pub fn db_path(&self) -> Option<&str> {
        self.store
            .db_path
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// Load and parse a PluginConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<PluginConfig> {
    if !config_path.exists() {
        return Ok(PluginConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: PluginConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_runs_migration_on_init() {
        let config = PluginConfig::default();
        assert!(config.migration.run_on_init);
        assert!(config.db_path().is_none());
        assert_eq!(config.busy_timeout_with_lookup(|_| None), DEFAULT_BUSY_TIMEOUT);
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/structcombolookup.toml")).expect("load config");
        assert_eq!(config, PluginConfig::default());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("structcombolookup.toml");
        fs::write(
            &config_path,
            r#"
[store]
db_path = "data/meta/struct.sqlite3"
busy_timeout_secs = 12

[migration]
run_on_init = false
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.db_path(), Some("data/meta/struct.sqlite3"));
        assert_eq!(
            config.busy_timeout_with_lookup(|_| None),
            Duration::from_secs(12)
        );
        assert!(!config.migration.run_on_init);
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("structcombolookup.toml");
        fs::write(&config_path, "[store]\nbusy_timeout_secs = 1\n").expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert!(config.migration.run_on_init);
        assert!(config.db_path().is_none());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("structcombolookup.toml");
        fs::write(&config_path, "[store\ndb_path = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn env_busy_timeout_overrides_config() {
        let config = PluginConfig {
            store: StoreSection {
                db_path: None,
                busy_timeout_secs: Some(12),
            },
            ..PluginConfig::default()
        };
        let env = HashMap::from([("STRUCT_BUSY_TIMEOUT_SECS".to_string(), " 30 ".to_string())]);
        assert_eq!(
            config.busy_timeout_with_lookup(|key| env.get(key).cloned()),
            Duration::from_secs(30)
        );

        let garbage = HashMap::from([("STRUCT_BUSY_TIMEOUT_SECS".to_string(), "soon".to_string())]);
        assert_eq!(
            config.busy_timeout_with_lookup(|key| garbage.get(key).cloned()),
            Duration::from_secs(12)
        );
    }

    #[test]
    fn blank_db_path_is_ignored() {
        let config = PluginConfig {
            store: StoreSection {
                db_path: Some("   ".to_string()),
                busy_timeout_secs: None,
            },
            ..PluginConfig::default()
        };
        assert!(config.db_path().is_none());
    }
}

//! CLI configuration.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use synapse_core::StoragePaths;

/// File name looked up in the config directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Data root. When set without `config_dir`/`cache_dir`, those live under it too.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default)]
    pub backups: BackupConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    #[serde(default = "default_max_count")]
    pub max_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_max_age_days() -> u64 {
    30
}

fn default_max_count() -> usize {
    100
}

fn default_limit() -> usize {
    synapse_core::DEFAULT_SEARCH_LIMIT
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            max_count: default_max_count(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            config_dir: None,
            cache_dir: None,
            lock_timeout_secs: default_lock_timeout_secs(),
            backups: BackupConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `{config_dir}/config.toml` for the given data root (or the platform
    /// default), falling back to defaults when there is no file.
    pub fn load(data_dir: Option<&Path>) -> Result<Self> {
        if let Some(config_path) = default_config_path(data_dir) {
            if config_path.exists() {
                return Self::load_from(&config_path);
            }
        }

        Ok(Config::default())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Resolve storage directories. Unset directories take the platform default,
    /// except that a lone `data_dir` keeps config and cache under itself.
    pub fn storage_paths(&self) -> Result<StoragePaths> {
        let paths = match (&self.data_dir, &self.config_dir, &self.cache_dir) {
            (Some(data), None, None) => StoragePaths::with_root(data),
            (data, config, cache) => {
                let platform = StoragePaths::new().ok();
                let pick = |explicit: &Option<PathBuf>, fallback: Option<&Path>, what: &str| {
                    explicit
                        .clone()
                        .or_else(|| fallback.map(Path::to_path_buf))
                        .ok_or_else(|| anyhow::anyhow!("no {} directory configured", what))
                };
                StoragePaths::from_parts(
                    pick(data, platform.as_ref().map(|p| p.data_dir()), "data")?,
                    pick(config, platform.as_ref().map(|p| p.config_dir()), "config")?,
                    pick(cache, platform.as_ref().map(|p| p.cache_dir()), "cache")?,
                )
            }
        };
        Ok(paths)
    }

    /// Pretty TOML with every default spelled out.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Where `Config::load` looks for the config file.
pub fn default_config_path(data_dir: Option<&Path>) -> Option<PathBuf> {
    let paths = match data_dir {
        Some(dir) => StoragePaths::with_root(dir),
        None => StoragePaths::new().ok()?,
    };
    Some(paths.config_dir().join(CONFIG_FILE_NAME))
}

//! Platform storage locations and the directory layout under them.
//!
//! Default locations come from the platform conventions:
//! - Linux: `~/.local/share/synapse-mcp/` (data), `~/.config/synapse-mcp/`, `~/.cache/synapse-mcp/`
//! - macOS: `~/Library/Application Support/synapse-mcp/`, `~/Library/Caches/synapse-mcp/`
//! - Windows: `%APPDATA%\synapse-mcp\`, `%LOCALAPPDATA%\synapse-mcp\`

use crate::{Result, SynapseError};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Application directory name under each platform base directory.
pub const APP_DIR_NAME: &str = "synapse-mcp";

const PERMISSION_PROBE: &str = ".permission_test";

/// Resolves every directory the store uses. Cheap to clone; holds no state
/// beyond the three roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    data_dir: PathBuf,
    config_dir: PathBuf,
    cache_dir: PathBuf,
}

impl StoragePaths {
    /// Resolve the platform default directories.
    pub fn new() -> Result<Self> {
        let base = |dir: Option<PathBuf>, what: &str| {
            dir.map(|d| d.join(APP_DIR_NAME))
                .ok_or_else(|| SynapseError::PathUnavailable(format!("no platform {} directory", what)))
        };

        Ok(Self {
            data_dir: base(dirs::data_dir(), "data")?,
            config_dir: base(dirs::config_dir(), "config")?,
            cache_dir: base(dirs::cache_dir(), "cache")?,
        })
    }

    /// Keep everything under a single root: data at `root`, config and cache
    /// in `root/config` and `root/cache`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_dir: root.join("config"),
            cache_dir: root.join("cache"),
            data_dir: root,
        }
    }

    /// Explicit roots for each of the three base directories.
    pub fn from_parts(data_dir: PathBuf, config_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            data_dir,
            config_dir,
            cache_dir,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Conversation records, partitioned as `YYYY/MM/`.
    pub fn conversations_dir(&self) -> PathBuf {
        self.data_dir.join("conversations")
    }

    pub fn solutions_dir(&self) -> PathBuf {
        self.data_dir.join("solutions")
    }

    pub fn indexes_dir(&self) -> PathBuf {
        self.data_dir.join("indexes")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    /// Lock files backing the OS advisory locks.
    pub fn locks_dir(&self) -> PathBuf {
        self.cache_dir.join("locks")
    }

    /// Every named directory, keyed by name.
    pub fn all_directories(&self) -> BTreeMap<&'static str, PathBuf> {
        BTreeMap::from([
            ("data", self.data_dir.clone()),
            ("config", self.config_dir.clone()),
            ("cache", self.cache_dir.clone()),
            ("conversations", self.conversations_dir()),
            ("solutions", self.solutions_dir()),
            ("indexes", self.indexes_dir()),
            ("logs", self.logs_dir()),
            ("backups", self.backups_dir()),
        ])
    }

    /// Display form of [`Self::all_directories`].
    pub fn storage_info(&self) -> BTreeMap<String, String> {
        self.all_directories()
            .into_iter()
            .map(|(name, path)| (name.to_string(), path.display().to_string()))
            .collect()
    }

    /// Create a directory and its parents. Returns false (and logs) on failure.
    pub fn create_directory(&self, path: &Path) -> bool {
        match fs::create_dir_all(path) {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "synapse::paths", "Failed to create directory {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Check that `path` is writable by creating and removing a probe file.
    /// The directory is created first if missing.
    pub fn validate_permissions(&self, path: &Path) -> bool {
        let probe = path.join(PERMISSION_PROBE);
        let result = fs::create_dir_all(path)
            .and_then(|_| fs::File::create(&probe).map(drop))
            .and_then(|_| fs::remove_file(&probe));

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "synapse::paths", "No write permission for {}: {}", path.display(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_under_root() {
        let paths = StoragePaths::with_root("/tmp/synapse-root");
        assert_eq!(paths.conversations_dir(), PathBuf::from("/tmp/synapse-root/conversations"));
        assert_eq!(paths.indexes_dir(), PathBuf::from("/tmp/synapse-root/indexes"));
        assert_eq!(paths.backups_dir(), PathBuf::from("/tmp/synapse-root/backups"));
        assert_eq!(paths.cache_dir(), Path::new("/tmp/synapse-root/cache"));
        assert_eq!(paths.all_directories().len(), 8);
    }

    #[test]
    fn test_create_directory_and_permissions() {
        let dir = TempDir::new().unwrap();
        let paths = StoragePaths::with_root(dir.path());
        let nested = paths.conversations_dir().join("2024").join("03");

        assert!(paths.create_directory(&nested));
        assert!(nested.is_dir());
        assert!(paths.validate_permissions(&nested));
        assert!(!nested.join(PERMISSION_PROBE).exists());
    }

    #[test]
    fn test_create_directory_over_file_fails() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"x").unwrap();

        let paths = StoragePaths::with_root(dir.path());
        assert!(!paths.create_directory(&file.join("child")));
        assert!(!paths.validate_permissions(&file));
    }

    #[test]
    fn test_storage_info_keys() {
        let paths = StoragePaths::with_root("/data");
        let info = paths.storage_info();
        assert!(info.contains_key("conversations"));
        assert!(info.contains_key("logs"));
    }
}

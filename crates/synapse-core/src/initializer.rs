//! First-run setup and storage health reporting.

use crate::atomic;
use crate::paths::StoragePaths;
use crate::search_index::{IndexDocument, INDEX_FILE_NAME};
use crate::{Result, SynapseError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

const MARKER_FILE: &str = ".initialized";

/// Contents of the `.initialized` marker in the config directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitMarker {
    pub initialized_at: DateTime<Utc>,
    pub version: String,
    pub platform: String,
    pub storage_paths: BTreeMap<String, String>,
}

/// What `initialize` did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitReport {
    pub already_initialized: bool,
    pub created_directories: Vec<PathBuf>,
    pub created_index: bool,
    /// Directories that failed the write probe.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryStatus {
    pub path: PathBuf,
    pub exists: bool,
    pub writable: bool,
    /// `None` when the tree could not be walked.
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    pub initialized: bool,
    pub storage_paths: BTreeMap<String, String>,
    pub directories: BTreeMap<String, DirectoryStatus>,
    pub permissions_ok: bool,
    pub total_size_bytes: u64,
}

pub struct StorageInitializer {
    paths: StoragePaths,
}

impl StorageInitializer {
    pub fn new(paths: StoragePaths) -> Self {
        Self { paths }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.paths.config_dir().join(MARKER_FILE)
    }

    pub fn is_initialized(&self) -> bool {
        self.marker_path().is_file()
    }

    /// Create the directory layout and an empty search index, probe write
    /// permissions, and write the marker. A no-op on initialized storage
    /// unless `force` is set. Permission problems are reported as warnings;
    /// a directory that cannot be created is an error.
    pub fn initialize(&self, force: bool) -> Result<InitReport> {
        let mut report = InitReport::default();
        if self.is_initialized() && !force {
            info!(target: "synapse::init", "Storage already initialized");
            report.already_initialized = true;
            return Ok(report);
        }

        for (name, path) in self.paths.all_directories() {
            let existed = path.is_dir();
            if !self.paths.create_directory(&path) {
                return Err(SynapseError::PathUnavailable(format!(
                    "failed to create {} directory {}",
                    name,
                    path.display()
                )));
            }
            if !existed {
                report.created_directories.push(path);
            }
        }

        let index_path = self.paths.indexes_dir().join(INDEX_FILE_NAME);
        if !index_path.exists() {
            atomic::write_json(&index_path, &IndexDocument::default())?;
            report.created_index = true;
        }

        for (name, path) in self.paths.all_directories() {
            if !self.paths.validate_permissions(&path) {
                report
                    .warnings
                    .push(format!("limited permissions for {} directory: {}", name, path.display()));
            }
        }

        let marker = InitMarker {
            initialized_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            storage_paths: self.paths.storage_info(),
        };
        atomic::write_json(&self.marker_path(), &marker)?;

        info!(
            target: "synapse::init",
            "Storage initialized at {} ({} directories created, {} warnings)",
            self.paths.data_dir().display(),
            report.created_directories.len(),
            report.warnings.len()
        );
        Ok(report)
    }

    /// Per-directory existence, writability, and size.
    pub fn storage_status(&self) -> StorageStatus {
        let mut directories = BTreeMap::new();
        let mut permissions_ok = true;
        let mut total_size_bytes = 0;

        for (name, path) in self.paths.all_directories() {
            let exists = path.is_dir();
            let writable = exists && self.paths.validate_permissions(&path);
            let size_bytes = if exists { tree_size(&path) } else { Some(0) };

            permissions_ok &= writable;
            total_size_bytes += size_bytes.unwrap_or(0);
            directories.insert(
                name.to_string(),
                DirectoryStatus {
                    path,
                    exists,
                    writable,
                    size_bytes,
                },
            );
        }

        StorageStatus {
            initialized: self.is_initialized(),
            storage_paths: self.paths.storage_info(),
            directories,
            permissions_ok,
            total_size_bytes,
        }
    }
}

fn tree_size(dir: &Path) -> Option<u64> {
    let mut total = 0;
    for entry in WalkDir::new(dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(target: "synapse::init", "Failed to size {}: {}", dir.display(), e);
                return None;
            }
        };
        if entry.file_type().is_file() {
            total += entry.metadata().ok()?.len();
        }
    }
    Some(total)
}

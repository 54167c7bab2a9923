//! Error types for Synapse storage.

use std::path::PathBuf;
use std::time::Duration;
use synapse_types::ValidationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SynapseError {
    #[error("Timed out after {waited:?} waiting for lock on {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Invalid record: {0}")]
    Validation(#[from] ValidationError),

    #[error("Source directory not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Storage path unavailable: {0}")]
    PathUnavailable(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Directory walk error: {0}")]
    WalkError(#[from] walkdir::Error),
}

impl SynapseError {
    /// True when the operation failed because another holder kept the lock.
    /// Callers may retry; the underlying data is untouched.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, SynapseError::LockTimeout { .. })
    }
}

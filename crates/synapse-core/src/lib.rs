//! Storage and search core for the Synapse knowledge store.
//!
//! [`FileStore`] persists conversation and solution records as JSON files with
//! atomic writes, per-path locking, and backups. [`SearchIndex`] maintains a
//! separate inverted index over conversation metadata. Callers keep the two in
//! sync; neither triggers the other.

mod atomic;
mod error;
mod file_store;
mod initializer;
mod lock;
mod paths;
mod repair;
mod search_index;
mod tokenizer;

pub use error::SynapseError;
pub use file_store::{BackupInfo, BatchSummary, FileStore, MergeMode, StorageStats};
pub use initializer::{DirectoryStatus, InitMarker, InitReport, StorageInitializer, StorageStatus};
pub use lock::{LockMode, LockTable, ScopedFileLock, DEFAULT_LOCK_TIMEOUT};
pub use paths::StoragePaths;
pub use repair::{infer_language, repair_solutions};
pub use search_index::{
    IndexDocument, IndexStats, IndexedMetadata, RebuildStats, SearchHit, SearchIndex,
    SearchQuery, TimeRange, DEFAULT_SEARCH_LIMIT,
};
pub use tokenizer::tokenize;

/// Result type for Synapse storage operations.
pub type Result<T> = std::result::Result<T, SynapseError>;

//! Shared application state.

use crate::config::Config;
use synapse_core::{FileStore, SearchIndex, StorageInitializer, StoragePaths};

/// Everything a command needs: the resolved config, the record store, and the
/// search index over the same storage root.
pub struct AppState {
    pub config: Config,
    pub paths: StoragePaths,
    pub store: FileStore,
    pub index: SearchIndex,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let paths = config.storage_paths()?;
        let store = FileStore::with_lock_timeout(paths.clone(), config.lock_timeout());
        let index = SearchIndex::new(&paths);

        tracing::debug!(
            target: "synapse::cli",
            "Using storage at {} (config {}, cache {})",
            paths.data_dir().display(),
            paths.config_dir().display(),
            paths.cache_dir().display()
        );

        Ok(Self {
            config,
            paths,
            store,
            index,
        })
    }

    pub fn initializer(&self) -> StorageInitializer {
        StorageInitializer::new(self.paths.clone())
    }
}

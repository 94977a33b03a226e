//! Repository handle
//!
//! Bundles a store with the managers that operate on it. On disk a repository
//! is a directory holding `revstore.json` and the SQLite database.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{StoreConfig, CONFIG_FILE};
use crate::error::Result;
use crate::memory_store::MemoryVersionStore;
use crate::revision::RevisionManager;
use crate::sqlite_store::SqliteVersionStore;
use crate::store::VersionStore;
use crate::version::VersionManager;

/// Store plus managers for one repository
#[derive(Clone)]
pub struct Repository {
    root: Option<PathBuf>,
    config: StoreConfig,
    versions: VersionManager,
}

impl Repository {
    /// Create the repository directory and its configuration, then open it
    pub fn init(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        if !root.join(CONFIG_FILE).exists() {
            StoreConfig::default().save(root)?;
        }
        tracing::info!("Initialized repository at {:?}", root);
        Self::open(root)
    }

    /// Open an on-disk repository
    pub fn open(root: &Path) -> Result<Self> {
        let config = StoreConfig::load(root)?;
        let store = SqliteVersionStore::open(&root.join(&config.database_file), &config)?;
        Ok(Self::with_store(Arc::new(store), config, Some(root.to_path_buf())))
    }

    /// Repository kept entirely in memory
    pub fn in_memory(config: StoreConfig) -> Self {
        Self::with_store(Arc::new(MemoryVersionStore::new()), config, None)
    }

    /// Wrap an existing store
    pub fn with_store(
        store: Arc<dyn VersionStore>,
        config: StoreConfig,
        root: Option<PathBuf>,
    ) -> Self {
        let revisions = RevisionManager::new(store, config.revision_config());
        Self {
            root,
            config,
            versions: VersionManager::new(revisions),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub fn revisions(&self) -> &RevisionManager {
        self.versions.revisions()
    }

    pub fn store(&self) -> &Arc<dyn VersionStore> {
        self.revisions().store()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::PutMode;
    use bytes::Bytes;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_init_writes_config() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        let repo = Repository::init(&root).unwrap();
        assert!(root.join(CONFIG_FILE).exists());
        assert!(root.join(&repo.config().database_file).exists());
        assert_eq!(repo.root(), Some(root.as_path()));
    }

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let repo = Repository::in_memory(StoreConfig::default());
        let version = repo.versions().create_root().await.unwrap().id;
        let mut resources = BTreeMap::new();
        resources.insert("readme".to_string(), Bytes::from_static(b"text"));
        repo.versions()
            .put_resources(version, resources, PutMode::Merge)
            .await
            .unwrap();
        assert_eq!(
            repo.versions().load_resource(version, "readme").await.unwrap(),
            Bytes::from_static(b"text")
        );
        assert!(repo.root().is_none());
    }
}

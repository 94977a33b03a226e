//! Version manager
//!
//! A version owns a changeset (path -> revision) and a list of parent
//! versions. It starts open, accepts resource updates, and is sealed by
//! `commit`, after which it can no longer change.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::digest::ContentHash;
use crate::error::{Result, VcsError};
use crate::model::{
    now_millis, Changeset, PathId, PathQuery, ResourceEntry, Revision, Version, VersionId,
    VersionUpdate,
};
use crate::revision::{RevisionManager, StoreContentOptions};
use crate::store::{with_transaction, TxMode, VersionStore};

/// How `put_resources` treats entries not named in the update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutMode {
    /// Keep the other entries
    #[default]
    Merge,
    /// Drop every entry first
    Replace,
}

/// Selection for `list_resources`
///
/// `paths` wins over `path_ids`; both are narrowed further by `prefix`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    pub paths: Option<Vec<String>>,
    pub path_ids: Option<Vec<PathId>>,
    pub prefix: Option<String>,
    /// With a prefix, keep only direct children of it
    pub shallow: bool,
}

impl ResourceFilter {
    /// Every resource of the version
    pub fn all() -> Self {
        Self::default()
    }

    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: Some(paths.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Default::default()
        }
    }

    pub fn shallow(mut self) -> Self {
        self.shallow = true;
        self
    }

    fn matches(&self, path: &str) -> bool {
        let Some(prefix) = self.prefix.as_deref() else {
            return true;
        };
        let Some(rest) = path.strip_prefix(prefix) else {
            return false;
        };
        !self.shallow || !rest.trim_start_matches('/').contains('/')
    }
}

/// Descriptive fields recorded when a version is committed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub author: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Commit time in milliseconds; now when unset
    pub stamp: Option<i64>,
}

/// Document stored as the metadata blob of a committed version
///
/// Serialized with sorted maps, so equal inputs give equal bytes and the
/// version's seal is reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitManifest {
    pub version: VersionId,
    pub stamp: i64,
    pub parents: Vec<VersionId>,
    /// Path -> content hash of its revision
    pub entries: BTreeMap<String, ContentHash>,
    pub author: Option<String>,
    pub message: Option<String>,
    pub properties: BTreeMap<String, String>,
}

/// Walk two resource lists in path order
///
/// Both lists are sorted by path. At each step the entry with the smaller path
/// is handed to `callback` alone; entries with equal paths are handed over
/// together. `Some` results are collected in walk order.
pub fn merge_resource_lists<R, F>(
    first: &[ResourceEntry],
    second: &[ResourceEntry],
    mut callback: F,
) -> Vec<R>
where
    F: FnMut(Option<&ResourceEntry>, Option<&ResourceEntry>) -> Option<R>,
{
    let mut first: Vec<&ResourceEntry> = first.iter().collect();
    let mut second: Vec<&ResourceEntry> = second.iter().collect();
    first.sort_by(|a, b| a.path.cmp(&b.path));
    second.sort_by(|a, b| a.path.cmp(&b.path));

    let mut result = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < first.len() || j < second.len() {
        let (a, b) = match (first.get(i), second.get(j)) {
            (Some(a), Some(b)) => match a.path.cmp(&b.path) {
                std::cmp::Ordering::Less => {
                    i += 1;
                    (Some(*a), None)
                }
                std::cmp::Ordering::Greater => {
                    j += 1;
                    (None, Some(*b))
                }
                std::cmp::Ordering::Equal => {
                    i += 1;
                    j += 1;
                    (Some(*a), Some(*b))
                }
            },
            (Some(a), None) => {
                i += 1;
                (Some(*a), None)
            }
            (None, Some(b)) => {
                j += 1;
                (None, Some(*b))
            }
            (None, None) => break,
        };
        if let Some(merged) = callback(a, b) {
            result.push(merged);
        }
    }
    result
}

/// Creates, edits, commits and links versions
#[derive(Clone)]
pub struct VersionManager {
    revisions: RevisionManager,
}

impl VersionManager {
    pub fn new(revisions: RevisionManager) -> Self {
        Self { revisions }
    }

    pub fn revisions(&self) -> &RevisionManager {
        &self.revisions
    }

    fn store(&self) -> &dyn VersionStore {
        self.revisions.store().as_ref()
    }

    /// New open version with no parents and an empty changeset
    pub async fn create_root(&self) -> Result<Version> {
        let version = self.store().put_version(VersionUpdate::default()).await?;
        tracing::debug!("Created root version {}", version.id);
        Ok(version)
    }

    /// New open version inheriting a copy of `parent`'s changeset
    pub async fn create_child(&self, parent: VersionId) -> Result<Version> {
        let store = self.store();
        with_transaction(store, TxMode::Write, || async {
            self.load_version(parent).await?;
            let changeset = store.get_changeset(parent).await?;
            let child = store.put_version(VersionUpdate::default()).await?;
            store.put_changeset(child.id, &changeset, true).await?;
            store.put_version_parents(child.id, &[parent]).await?;
            tracing::debug!(
                "Created version {} from {} with {} resources",
                child.id,
                parent,
                changeset.len()
            );
            Ok(child)
        })
        .await
    }

    pub async fn load_version(&self, id: VersionId) -> Result<Version> {
        self.store()
            .get_version(id)
            .await?
            .ok_or(VcsError::VersionNotFound(id))
    }

    /// Committed version whose seal is `seal`
    pub async fn find_by_seal(&self, seal: &ContentHash) -> Result<Option<Version>> {
        let store = self.store();
        with_transaction(store, TxMode::Read, || async {
            match store.find_blob(seal).await? {
                Some(metadata) => store.get_version_by_metadata(metadata.id).await,
                None => Ok(None),
            }
        })
        .await
    }

    /// Every version in the store, oldest id first
    pub async fn list_versions(&self) -> Result<Vec<VersionId>> {
        self.store().list_versions().await
    }

    pub async fn is_committed(&self, id: VersionId) -> Result<bool> {
        Ok(self.load_version(id).await?.is_committed())
    }

    async fn load_open_version(&self, id: VersionId) -> Result<Version> {
        let version = self.load_version(id).await?;
        if version.is_committed() {
            return Err(VcsError::AlreadyCommitted(id));
        }
        Ok(version)
    }

    /// Store new content for `resources`, then record it in the changeset
    pub async fn put_resources(
        &self,
        version: VersionId,
        resources: BTreeMap<String, Bytes>,
        mode: PutMode,
    ) -> Result<BTreeMap<String, Revision>> {
        let store = self.store();
        with_transaction(store, TxMode::Write, || async {
            let built = self.build_entries(version, resources).await?;
            let mapping: Changeset = built
                .values()
                .map(|(path_id, revision)| (*path_id, revision.id))
                .collect();
            let changeset = store
                .put_changeset(version, &mapping, mode == PutMode::Replace)
                .await?;
            tracing::debug!(
                "Version {} now has {} resources after storing {}",
                version,
                changeset.len(),
                mapping.len()
            );
            Ok(built
                .into_iter()
                .map(|(path, (_, revision))| (path, revision))
                .collect())
        })
        .await
    }

    /// Store content revisions for `resources` without touching the changeset
    pub async fn build_revisions(
        &self,
        version: VersionId,
        resources: BTreeMap<String, Bytes>,
    ) -> Result<BTreeMap<String, Revision>> {
        let built = with_transaction(self.store(), TxMode::Write, || {
            self.build_entries(version, resources)
        })
        .await?;
        Ok(built
            .into_iter()
            .map(|(path, (_, revision))| (path, revision))
            .collect())
    }

    async fn build_entries(
        &self,
        version: VersionId,
        resources: BTreeMap<String, Bytes>,
    ) -> Result<BTreeMap<String, (PathId, Revision)>> {
        let store = self.store();
        self.load_open_version(version).await?;

        let paths: Vec<String> = resources.keys().cloned().collect();
        let path_ids = store.intern_paths(&paths).await?;
        let current = store.get_changeset(version).await?;

        let mut built = BTreeMap::new();
        for (path, content) in resources {
            let path_id = *path_ids
                .get(&path)
                .ok_or_else(|| VcsError::PathNotFound(path.clone()))?;
            let options = StoreContentOptions::with_base(current.get(&path_id).copied());
            let revision = self.revisions.store_content(content, options).await?;
            built.insert(path, (path_id, revision));
        }
        Ok(built)
    }

    /// Resources of a version, sorted by path
    pub async fn list_resources(
        &self,
        version: VersionId,
        filter: &ResourceFilter,
    ) -> Result<Vec<ResourceEntry>> {
        let store = self.store();
        with_transaction(store, TxMode::Read, || async {
            self.load_version(version).await?;
            let changeset = store.get_changeset(version).await?;

            let candidates = match (&filter.paths, &filter.path_ids, &filter.prefix) {
                (Some(paths), _, _) => store.resolve_paths(PathQuery::Paths(paths.clone())).await?,
                (None, Some(ids), _) => store.resolve_paths(PathQuery::Ids(ids.clone())).await?,
                (None, None, Some(prefix)) => store.list_paths_with_prefix(prefix).await?,
                (None, None, None) => {
                    store
                        .resolve_paths(PathQuery::Ids(changeset.keys().copied().collect()))
                        .await?
                }
            };

            let mut entries = Vec::new();
            for (path, path_id) in candidates {
                let Some(revision_id) = changeset.get(&path_id) else {
                    continue;
                };
                if !filter.matches(&path) {
                    continue;
                }
                let revision = self.revisions.load_revision(*revision_id).await?;
                entries.push(ResourceEntry {
                    path,
                    path_id,
                    revision,
                });
            }
            Ok(entries)
        })
        .await
    }

    /// The entry for one path; `PathNotFound` when the version lacks it
    pub async fn get_resource(&self, version: VersionId, path: &str) -> Result<ResourceEntry> {
        self.list_resources(version, &ResourceFilter::paths([path]))
            .await?
            .pop()
            .ok_or_else(|| VcsError::PathNotFound(path.to_string()))
    }

    /// Verified content stored for one path
    pub async fn load_resource(&self, version: VersionId, path: &str) -> Result<Bytes> {
        let entry = self.get_resource(version, path).await?;
        self.revisions.reconstruct(&entry.revision).await
    }

    /// Drop changeset entries; returns how many were present
    pub async fn remove_resources(&self, version: VersionId, paths: &[String]) -> Result<usize> {
        let store = self.store();
        with_transaction(store, TxMode::Write, || async {
            self.load_open_version(version).await?;
            let ids = store.resolve_paths(PathQuery::Paths(paths.to_vec())).await?;
            let mut changeset = store.get_changeset(version).await?;
            let before = changeset.len();
            for path_id in ids.values() {
                changeset.remove(path_id);
            }
            let removed = before - changeset.len();
            if removed > 0 {
                store.put_changeset(version, &changeset, true).await?;
            }
            Ok(removed)
        })
        .await
    }

    /// Seal a version with a commit manifest
    pub async fn commit(&self, version: VersionId, info: CommitInfo) -> Result<Version> {
        let store = self.store();
        with_transaction(store, TxMode::Write, || async {
            self.load_open_version(version).await?;

            let changeset = store.get_changeset(version).await?;
            let paths = store
                .resolve_paths(PathQuery::Ids(changeset.keys().copied().collect()))
                .await?;
            let mut entries = BTreeMap::new();
            for (path, path_id) in paths {
                if let Some(revision_id) = changeset.get(&path_id) {
                    let revision = self.revisions.load_revision(*revision_id).await?;
                    entries.insert(path, revision.hash);
                }
            }

            let manifest = CommitManifest {
                version,
                stamp: info.stamp.unwrap_or_else(now_millis),
                parents: store.get_version_parents(version).await?,
                entries,
                author: info.author,
                message: info.message,
                properties: info.properties,
            };
            let blob = store
                .put_blob(Bytes::from(serde_json::to_vec(&manifest)?))
                .await?;
            let sealed = store
                .put_version(VersionUpdate {
                    id: Some(version),
                    metadata_id: Some(blob.id),
                    ..Default::default()
                })
                .await?;
            tracing::info!(
                "Committed version {} ({} resources, seal {})",
                version,
                manifest.entries.len(),
                blob.hash
            );
            Ok(sealed)
        })
        .await
    }

    /// Manifest of a committed version; `None` while it is open
    pub async fn load_commit_info(&self, version: VersionId) -> Result<Option<CommitManifest>> {
        let store = self.store();
        with_transaction(store, TxMode::Read, || async {
            let Some(metadata_id) = self.load_version(version).await?.metadata_id else {
                return Ok(None);
            };
            let blob = store
                .get_blob(metadata_id)
                .await?
                .ok_or(VcsError::BlobNotFound(metadata_id))?;
            Ok(Some(serde_json::from_slice(&blob.content)?))
        })
        .await
    }

    pub async fn parents(&self, version: VersionId) -> Result<Vec<VersionId>> {
        self.load_version(version).await?;
        self.store().get_version_parents(version).await
    }

    pub async fn children(&self, version: VersionId) -> Result<Vec<VersionId>> {
        self.load_version(version).await?;
        self.store().get_version_children(version).await
    }

    /// Replace the parents of an open version
    pub async fn set_parents(
        &self,
        version: VersionId,
        parents: &[VersionId],
    ) -> Result<Vec<VersionId>> {
        let store = self.store();
        with_transaction(store, TxMode::Write, || async {
            self.load_open_version(version).await?;
            for parent in parents {
                self.load_version(*parent).await?;
                if self.has_ancestor(*parent, version).await? {
                    return Err(VcsError::CycleDetected {
                        version,
                        parent: *parent,
                    });
                }
            }
            store.put_version_parents(version, parents).await
        })
        .await
    }

    /// Whether `ancestor` is `start` or reachable from it through parent links
    async fn has_ancestor(&self, start: VersionId, ancestor: VersionId) -> Result<bool> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            if current == ancestor {
                return Ok(true);
            }
            for parent in self.store().get_version_parents(current).await? {
                if seen.insert(parent) {
                    queue.push_back(parent);
                }
            }
        }
        Ok(false)
    }

    /// `version` and its ancestors, newest stamp first, at most `limit` of them
    pub async fn history(&self, version: VersionId, limit: usize) -> Result<Vec<Version>> {
        let store = self.store();
        with_transaction(store, TxMode::Read, || async {
            let mut seen = HashSet::from([version]);
            let mut queue = VecDeque::from([version]);
            let mut versions = Vec::new();
            while let Some(current) = queue.pop_front() {
                versions.push(self.load_version(current).await?);
                for parent in store.get_version_parents(current).await? {
                    if seen.insert(parent) {
                        queue.push_back(parent);
                    }
                }
            }
            versions.sort_by(|a, b| b.stamp.cmp(&a.stamp).then(b.id.cmp(&a.id)));
            versions.truncate(limit);
            Ok(versions)
        })
        .await
    }
}

//! In-memory store implementation
//!
//! Keeps every table in one `MemoryState` behind a single lock, id counter
//! included. Write transactions snapshot the state and restore it on rollback.
//! A blob still referenced by a revision or a version cannot be deleted.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::RwLock;

use crate::digest::{digest, ContentHash};
use crate::error::{Result, VcsError};
use crate::model::{
    now_millis, Blob, BlobId, BlobRef, Changeset, NewRevision, PathId, PathQuery, Revision,
    RevisionId, Version, VersionId, VersionUpdate,
};
use crate::store::{
    dedup_parents, TxAction, TxDepth, TxGate, TxMode, TxOutcome, VersionStore,
};

#[derive(Debug, Clone, Copy)]
struct VersionRow {
    stamp: i64,
    metadata_id: Option<BlobId>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    /// Last id handed out, shared by every table
    last_id: i64,
    blobs: HashMap<BlobId, Blob>,
    blob_ids: HashMap<ContentHash, BlobId>,
    paths: BTreeMap<String, PathId>,
    path_names: HashMap<PathId, String>,
    revisions: HashMap<RevisionId, Revision>,
    revision_ids: HashMap<ContentHash, RevisionId>,
    versions: HashMap<VersionId, VersionRow>,
    changesets: HashMap<VersionId, Changeset>,
    parents: HashMap<VersionId, Vec<VersionId>>,
    children: HashMap<VersionId, BTreeSet<VersionId>>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn version(&self, id: VersionId) -> Option<Version> {
        self.versions.get(&id).map(|row| Version {
            id,
            stamp: row.stamp,
            metadata_id: row.metadata_id,
            seal: row
                .metadata_id
                .and_then(|blob_id| self.blobs.get(&blob_id))
                .map(|blob| blob.hash),
        })
    }

    fn blob_in_use(&self, id: BlobId) -> bool {
        self.revisions
            .values()
            .any(|r| r.base_blob_id == id || r.diff_blob_id == Some(id))
            || self.versions.values().any(|v| v.metadata_id == Some(id))
    }

    fn require_version(&self, id: VersionId) -> Result<()> {
        if self.versions.contains_key(&id) {
            Ok(())
        } else {
            Err(VcsError::VersionNotFound(id))
        }
    }
}

#[derive(Debug, Default)]
struct TxState {
    depth: TxDepth,
    snapshot: Option<MemoryState>,
}

/// In-memory version store
#[derive(Debug, Default)]
pub struct MemoryVersionStore {
    state: RwLock<MemoryState>,
    tx: Mutex<TxState>,
    gate: TxGate,
}

impl MemoryVersionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_tx(&self) -> Result<MutexGuard<'_, TxState>> {
        self.tx
            .lock()
            .map_err(|_| VcsError::Transaction("transaction state lock poisoned".to_string()))
    }

    /// Overwrite stored bytes without touching hash or length
    #[cfg(test)]
    pub(crate) async fn tamper_blob(&self, id: BlobId, content: Bytes) {
        if let Some(blob) = self.state.write().await.blobs.get_mut(&id) {
            blob.content = content;
        }
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    fn gate(&self) -> &TxGate {
        &self.gate
    }

    async fn begin(&self, mode: TxMode) -> Result<()> {
        let _gate = self.gate.enter().await;
        let needs_snapshot = {
            let mut tx = self.lock_tx()?;
            tx.depth.enter();
            mode == TxMode::Write && tx.snapshot.is_none()
        };
        if needs_snapshot {
            let snapshot = self.state.read().await.clone();
            self.lock_tx()?.snapshot = Some(snapshot);
        }
        Ok(())
    }

    async fn end(&self, outcome: TxOutcome) -> Result<()> {
        let _gate = self.gate.enter().await;
        let (action, snapshot) = {
            let mut tx = self.lock_tx()?;
            let action = tx.depth.leave(outcome)?;
            let snapshot = match action {
                TxAction::Nested => None,
                _ => tx.snapshot.take(),
            };
            (action, snapshot)
        };

        match action {
            TxAction::Nested | TxAction::Begin | TxAction::Commit => Ok(()),
            TxAction::Rollback | TxAction::RollbackPoisoned => {
                if let Some(snapshot) = snapshot {
                    *self.state.write().await = snapshot;
                }
                tracing::debug!("Memory store transaction rolled back");
                if action == TxAction::RollbackPoisoned {
                    Err(VcsError::Transaction(
                        "transaction rolled back after a nested scope failed".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn put_blob(&self, content: Bytes) -> Result<BlobRef> {
        let _gate = self.gate.enter().await;
        let hash = digest(&content);
        let mut state = self.state.write().await;
        if let Some(existing) = state.blob_ids.get(&hash).and_then(|id| state.blobs.get(id)) {
            return Ok(existing.to_ref());
        }
        let id = BlobId(state.next_id());
        let blob = Blob {
            id,
            hash,
            length: content.len() as u64,
            content,
        };
        let blob_ref = blob.to_ref();
        state.blob_ids.insert(hash, id);
        state.blobs.insert(id, blob);
        Ok(blob_ref)
    }

    async fn get_blob(&self, id: BlobId) -> Result<Option<Blob>> {
        let _gate = self.gate.enter().await;
        Ok(self.state.read().await.blobs.get(&id).cloned())
    }

    async fn find_blob(&self, hash: &ContentHash) -> Result<Option<BlobRef>> {
        let _gate = self.gate.enter().await;
        let state = self.state.read().await;
        Ok(state
            .blob_ids
            .get(hash)
            .and_then(|id| state.blobs.get(id))
            .map(Blob::to_ref))
    }

    async fn delete_blob(&self, id: BlobId) -> Result<()> {
        let _gate = self.gate.enter().await;
        let mut state = self.state.write().await;
        if state.blob_in_use(id) {
            return Err(VcsError::BlobInUse(id));
        }
        if let Some(blob) = state.blobs.remove(&id) {
            state.blob_ids.remove(&blob.hash);
        }
        Ok(())
    }

    async fn intern_paths(&self, paths: &[String]) -> Result<BTreeMap<String, PathId>> {
        let _gate = self.gate.enter().await;
        let mut state = self.state.write().await;
        let mut result = BTreeMap::new();
        for path in paths {
            let id = match state.paths.get(path) {
                Some(id) => *id,
                None => {
                    let id = PathId(state.next_id());
                    state.paths.insert(path.clone(), id);
                    state.path_names.insert(id, path.clone());
                    id
                }
            };
            result.insert(path.clone(), id);
        }
        Ok(result)
    }

    async fn resolve_paths(&self, query: PathQuery) -> Result<BTreeMap<String, PathId>> {
        let _gate = self.gate.enter().await;
        let state = self.state.read().await;
        let result = match query {
            PathQuery::Paths(paths) => paths
                .into_iter()
                .filter_map(|path| state.paths.get(&path).map(|id| (path, *id)))
                .collect(),
            PathQuery::Ids(ids) => ids
                .into_iter()
                .filter_map(|id| state.path_names.get(&id).map(|path| (path.clone(), id)))
                .collect(),
        };
        Ok(result)
    }

    async fn list_paths_with_prefix(&self, prefix: &str) -> Result<BTreeMap<String, PathId>> {
        let _gate = self.gate.enter().await;
        let state = self.state.read().await;
        Ok(state
            .paths
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, id)| (path.clone(), *id))
            .collect())
    }

    async fn put_revision(&self, revision: NewRevision) -> Result<Revision> {
        let _gate = self.gate.enter().await;
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .revision_ids
            .get(&revision.hash)
            .and_then(|id| state.revisions.get(id))
        {
            if existing.length != revision.length {
                return Err(VcsError::RevisionLengthMismatch {
                    hash: revision.hash,
                    existing: existing.length,
                    requested: revision.length,
                });
            }
            return Ok(*existing);
        }
        for blob_id in std::iter::once(revision.base_blob_id).chain(revision.diff_blob_id) {
            if !state.blobs.contains_key(&blob_id) {
                return Err(VcsError::BlobNotFound(blob_id));
            }
        }
        let id = RevisionId(state.next_id());
        let stored = Revision {
            id,
            length: revision.length,
            hash: revision.hash,
            base_blob_id: revision.base_blob_id,
            diff_blob_id: revision.diff_blob_id,
        };
        state.revision_ids.insert(stored.hash, id);
        state.revisions.insert(id, stored);
        Ok(stored)
    }

    async fn get_revision(&self, id: RevisionId) -> Result<Option<Revision>> {
        let _gate = self.gate.enter().await;
        Ok(self.state.read().await.revisions.get(&id).copied())
    }

    async fn get_revision_by_hash(&self, hash: &ContentHash) -> Result<Option<Revision>> {
        let _gate = self.gate.enter().await;
        let state = self.state.read().await;
        Ok(state
            .revision_ids
            .get(hash)
            .and_then(|id| state.revisions.get(id))
            .copied())
    }

    async fn put_version(&self, update: VersionUpdate) -> Result<Version> {
        let _gate = self.gate.enter().await;
        let mut state = self.state.write().await;
        let id = match update.id {
            Some(id) => {
                let row = state
                    .versions
                    .get_mut(&id)
                    .ok_or(VcsError::VersionNotFound(id))?;
                if let Some(stamp) = update.stamp {
                    row.stamp = stamp;
                }
                if update.metadata_id.is_some() {
                    row.metadata_id = update.metadata_id;
                }
                id
            }
            None => {
                let id = VersionId(state.next_id());
                state.versions.insert(
                    id,
                    VersionRow {
                        stamp: update.stamp.unwrap_or_else(now_millis),
                        metadata_id: update.metadata_id,
                    },
                );
                id
            }
        };
        state.version(id).ok_or(VcsError::VersionNotFound(id))
    }

    async fn get_version(&self, id: VersionId) -> Result<Option<Version>> {
        let _gate = self.gate.enter().await;
        Ok(self.state.read().await.version(id))
    }

    async fn get_version_by_metadata(&self, metadata_id: BlobId) -> Result<Option<Version>> {
        let _gate = self.gate.enter().await;
        let state = self.state.read().await;
        let found = state
            .versions
            .iter()
            .filter(|(_, row)| row.metadata_id == Some(metadata_id))
            .map(|(id, _)| *id)
            .min();
        Ok(found.and_then(|id| state.version(id)))
    }

    async fn list_versions(&self) -> Result<Vec<VersionId>> {
        let _gate = self.gate.enter().await;
        let mut ids: Vec<VersionId> = self.state.read().await.versions.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn put_changeset(
        &self,
        version: VersionId,
        mapping: &Changeset,
        replace: bool,
    ) -> Result<Changeset> {
        let _gate = self.gate.enter().await;
        let mut state = self.state.write().await;
        state.require_version(version)?;
        let changeset = state.changesets.entry(version).or_default();
        if replace {
            changeset.clear();
        }
        changeset.extend(mapping.iter().map(|(path, rev)| (*path, *rev)));
        Ok(changeset.clone())
    }

    async fn get_changeset(&self, version: VersionId) -> Result<Changeset> {
        let _gate = self.gate.enter().await;
        Ok(self
            .state
            .read()
            .await
            .changesets
            .get(&version)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_version_parents(
        &self,
        version: VersionId,
        parents: &[VersionId],
    ) -> Result<Vec<VersionId>> {
        let _gate = self.gate.enter().await;
        let parents = dedup_parents(parents);
        let mut state = self.state.write().await;
        state.require_version(version)?;
        for parent in &parents {
            state.require_version(*parent)?;
        }

        let old_parents = state.parents.remove(&version).unwrap_or_default();
        for parent in old_parents {
            if let Some(children) = state.children.get_mut(&parent) {
                children.remove(&version);
            }
        }
        for parent in &parents {
            state.children.entry(*parent).or_default().insert(version);
        }
        state.parents.insert(version, parents.clone());
        Ok(parents)
    }

    async fn get_version_parents(&self, version: VersionId) -> Result<Vec<VersionId>> {
        let _gate = self.gate.enter().await;
        Ok(self
            .state
            .read()
            .await
            .parents
            .get(&version)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_version_children(&self, version: VersionId) -> Result<Vec<VersionId>> {
        let _gate = self.gate.enter().await;
        Ok(self
            .state
            .read()
            .await
            .children
            .get(&version)
            .map(|children| children.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::with_transaction;

    #[tokio::test]
    async fn test_rollback_restores_state() {
        let store = MemoryVersionStore::new();
        let kept = store.put_blob(Bytes::from_static(b"kept")).await.unwrap();

        let result: Result<()> = with_transaction(&store, TxMode::Write, || async {
            store.put_blob(Bytes::from_static(b"discarded")).await?;
            Err(VcsError::ContentRequired)
        })
        .await;
        assert!(matches!(result, Err(VcsError::ContentRequired)));

        assert!(store.get_blob(kept.id).await.unwrap().is_some());
        assert!(store.find_blob(&digest(b"discarded")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nested_failure_rolls_back_outer() {
        let store = MemoryVersionStore::new();

        let result: Result<()> = with_transaction(&store, TxMode::Write, || async {
            store.put_blob(Bytes::from_static(b"outer")).await?;
            let inner: Result<()> = with_transaction(&store, TxMode::Write, || async {
                store.put_blob(Bytes::from_static(b"inner")).await?;
                Err(VcsError::ContentRequired)
            })
            .await;
            assert!(inner.is_err());
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(VcsError::Transaction(_))));
        assert!(store.find_blob(&digest(b"outer")).await.unwrap().is_none());
        assert!(store.find_blob(&digest(b"inner")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prefix_listing_is_sorted() {
        let store = MemoryVersionStore::new();
        let paths: Vec<String> = ["foo/bar/file.doc", "foo/about.md", "foobar", "zeta"]
            .iter()
            .map(|p| p.to_string())
            .collect();
        store.intern_paths(&paths).await.unwrap();

        let listed = store.list_paths_with_prefix("foo/").await.unwrap();
        let names: Vec<&str> = listed.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["foo/about.md", "foo/bar/file.doc"]);
    }

    #[tokio::test]
    async fn test_referenced_blob_cannot_be_deleted() {
        let store = MemoryVersionStore::new();
        let blob = store.put_blob(Bytes::from_static(b"body")).await.unwrap();
        store
            .put_revision(NewRevision {
                length: blob.length,
                hash: blob.hash,
                base_blob_id: blob.id,
                diff_blob_id: None,
            })
            .await
            .unwrap();
        assert!(matches!(
            store.delete_blob(blob.id).await,
            Err(VcsError::BlobInUse(id)) if id == blob.id
        ));

        let meta = store.put_blob(Bytes::from_static(b"{}")).await.unwrap();
        let version = store
            .put_version(VersionUpdate {
                metadata_id: Some(meta.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(store.delete_blob(meta.id).await.is_err());
        assert_eq!(store.get_version(version.id).await.unwrap().unwrap().seal, Some(meta.hash));

        let loose = store.put_blob(Bytes::from_static(b"loose")).await.unwrap();
        store.delete_blob(loose.id).await.unwrap();
        assert!(store.get_blob(loose.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reparenting_updates_children() {
        let store = MemoryVersionStore::new();
        let v1 = store.put_version(VersionUpdate::default()).await.unwrap().id;
        let v2 = store.put_version(VersionUpdate::default()).await.unwrap().id;
        let v3 = store.put_version(VersionUpdate::default()).await.unwrap().id;

        store.put_version_parents(v3, &[v1]).await.unwrap();
        assert_eq!(store.get_version_children(v1).await.unwrap(), vec![v3]);

        store.put_version_parents(v3, &[v2]).await.unwrap();
        assert!(store.get_version_children(v1).await.unwrap().is_empty());
        assert_eq!(store.get_version_children(v2).await.unwrap(), vec![v3]);
    }
}

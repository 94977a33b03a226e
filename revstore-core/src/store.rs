//! Store boundary
//!
//! Durable storage of blobs, paths, revisions and versions is delegated to a
//! [`VersionStore`]. Managers only talk to this trait, so the in-memory and
//! SQLite backends are interchangeable.
//!
//! Every store owns a [`TxGate`]. An outermost [`with_transaction`] scope holds
//! the gate until it commits or rolls back, and every other store call waits
//! for it, so callers on other tasks never observe or disturb a transaction
//! in progress. Scopes opened while the gate is held by the current scope
//! join the outer transaction.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::future::Future;
use tokio::sync::{Mutex, MutexGuard};

use crate::digest::ContentHash;
use crate::error::Result;
use crate::model::{
    Blob, BlobId, BlobRef, Changeset, NewRevision, PathId, PathQuery, Revision, RevisionId,
    Version, VersionId, VersionUpdate,
};

/// Transaction scope requested by a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    Read,
    Write,
}

/// How a transaction scope ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Commit,
    Rollback,
}

tokio::task_local! {
    /// Gates held by the transaction scope being polled
    static HELD_GATES: Vec<usize>;
}

/// Serializes transactions and standalone calls on one store
#[derive(Debug, Default)]
pub struct TxGate {
    lock: Mutex<()>,
}

impl TxGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Whether the scope currently being polled holds this gate
    pub fn is_held(&self) -> bool {
        HELD_GATES
            .try_with(|held| held.contains(&self.key()))
            .unwrap_or(false)
    }

    /// Wait for the gate unless the current scope already holds it
    ///
    /// Backends call this at the top of every operation and keep the guard
    /// until the operation returns.
    pub async fn enter(&self) -> Option<MutexGuard<'_, ()>> {
        if self.is_held() {
            None
        } else {
            Some(self.lock.lock().await)
        }
    }
}

/// Nesting bookkeeping shared by the backends
///
/// Only the outermost scope touches the backend. A rollback in any inner scope
/// poisons the whole transaction.
#[derive(Debug, Default)]
pub(crate) struct TxDepth {
    depth: usize,
    rollback_only: bool,
}

/// What a backend has to do after `TxDepth` bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxAction {
    /// Joined or left a nested scope; nothing to do
    Nested,
    Begin,
    Commit,
    Rollback,
    /// Outer commit of a transaction an inner scope rolled back
    RollbackPoisoned,
}

impl TxDepth {
    pub(crate) fn enter(&mut self) -> TxAction {
        self.depth += 1;
        if self.depth == 1 {
            self.rollback_only = false;
            TxAction::Begin
        } else {
            TxAction::Nested
        }
    }

    pub(crate) fn leave(&mut self, outcome: TxOutcome) -> Result<TxAction> {
        if self.depth == 0 {
            return Err(crate::error::VcsError::Transaction(
                "end called without an open transaction".to_string(),
            ));
        }
        self.depth -= 1;
        if outcome == TxOutcome::Rollback {
            self.rollback_only = true;
        }
        if self.depth > 0 {
            return Ok(TxAction::Nested);
        }
        Ok(match (outcome, self.rollback_only) {
            (TxOutcome::Commit, false) => TxAction::Commit,
            (TxOutcome::Commit, true) => TxAction::RollbackPoisoned,
            (TxOutcome::Rollback, _) => TxAction::Rollback,
        })
    }

    pub(crate) fn is_active(&self) -> bool {
        self.depth > 0
    }
}

/// Parent list with duplicates removed, first occurrence wins
pub(crate) fn dedup_parents(parents: &[VersionId]) -> Vec<VersionId> {
    let mut seen = std::collections::HashSet::new();
    parents.iter().copied().filter(|p| seen.insert(*p)).collect()
}

/// Persistence backend consumed by the revision and version managers
///
/// `begin` and `end` are driven by [`with_transaction`], which holds the
/// store's gate around them.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Gate serializing transactions on this store
    fn gate(&self) -> &TxGate;

    /// Open (or join) a transaction scope
    async fn begin(&self, mode: TxMode) -> Result<()>;

    /// Close the innermost transaction scope
    async fn end(&self, outcome: TxOutcome) -> Result<()>;

    /// Store content, deduplicated by hash
    async fn put_blob(&self, content: Bytes) -> Result<BlobRef>;

    async fn get_blob(&self, id: BlobId) -> Result<Option<Blob>>;

    async fn find_blob(&self, hash: &ContentHash) -> Result<Option<BlobRef>>;

    async fn delete_blob(&self, id: BlobId) -> Result<()>;

    /// Intern paths, creating ids for unseen ones
    async fn intern_paths(&self, paths: &[String]) -> Result<BTreeMap<String, PathId>>;

    /// Resolve known paths or path ids; unknown entries are left out
    async fn resolve_paths(&self, query: PathQuery) -> Result<BTreeMap<String, PathId>>;

    /// All interned paths starting with `prefix`
    async fn list_paths_with_prefix(&self, prefix: &str) -> Result<BTreeMap<String, PathId>>;

    /// Record a revision, deduplicated by hash
    async fn put_revision(&self, revision: NewRevision) -> Result<Revision>;

    async fn get_revision(&self, id: RevisionId) -> Result<Option<Revision>>;

    async fn get_revision_by_hash(&self, hash: &ContentHash) -> Result<Option<Revision>>;

    /// Create (`id: None`) or update a version record
    async fn put_version(&self, update: VersionUpdate) -> Result<Version>;

    async fn get_version(&self, id: VersionId) -> Result<Option<Version>>;

    /// Version whose commit metadata is stored in blob `metadata_id`
    async fn get_version_by_metadata(&self, metadata_id: BlobId) -> Result<Option<Version>>;

    /// Ids of every stored version, ascending
    async fn list_versions(&self) -> Result<Vec<VersionId>>;

    /// Add entries to a changeset, or replace it entirely; returns the full
    /// mapping afterwards
    async fn put_changeset(
        &self,
        version: VersionId,
        mapping: &Changeset,
        replace: bool,
    ) -> Result<Changeset>;

    async fn get_changeset(&self, version: VersionId) -> Result<Changeset>;

    /// Replace the parent list of a version
    async fn put_version_parents(
        &self,
        version: VersionId,
        parents: &[VersionId],
    ) -> Result<Vec<VersionId>>;

    async fn get_version_parents(&self, version: VersionId) -> Result<Vec<VersionId>>;

    async fn get_version_children(&self, version: VersionId) -> Result<Vec<VersionId>>;
}

/// Run `body` inside a transaction scope on `store`
///
/// Commits when the body succeeds, rolls back when it fails. The body's error
/// wins over a rollback failure, which is only logged.
///
/// The outermost scope waits for the store's gate and holds it until the
/// transaction ends. Tasks spawned from inside `body` do not inherit the
/// scope and block on the gate like any other caller.
pub async fn with_transaction<S, T, F, Fut>(store: &S, mode: TxMode, body: F) -> Result<T>
where
    S: VersionStore + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let gate = store.gate();
    if gate.is_held() {
        return run_scope(store, mode, body).await;
    }

    let _guard = gate.lock.lock().await;
    let mut held = HELD_GATES.try_with(|held| held.clone()).unwrap_or_default();
    held.push(gate.key());
    HELD_GATES.scope(held, run_scope(store, mode, body)).await
}

async fn run_scope<S, T, F, Fut>(store: &S, mode: TxMode, body: F) -> Result<T>
where
    S: VersionStore + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    store.begin(mode).await?;
    match body().await {
        Ok(value) => {
            store.end(TxOutcome::Commit).await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = store.end(TxOutcome::Rollback).await {
                tracing::warn!("Rollback failed after {}: {}", err, rollback_err);
            }
            Err(err)
        }
    }
}

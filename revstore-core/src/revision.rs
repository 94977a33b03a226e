//! Revision manager
//!
//! Turns byte content into revisions. Content is stored either in full or as
//! an edit script against the full content of its chain root, whichever the
//! acceptance rule favours, and is verified against its hash on every load.
//!
//! Chains are root-anchored: a diff is always computed against the
//! `base_blob_id` of the base revision, which holds full content, and the new
//! revision records that same blob. Reconstruction therefore never needs more
//! than one patch step.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::config::RevisionConfig;
use crate::delta;
use crate::digest::{digest, ContentHash};
use crate::error::{Result, VcsError};
use crate::model::{Blob, NewRevision, Revision, RevisionId};
use crate::store::{with_transaction, TxMode, VersionStore};

/// Options for [`RevisionManager::store_content`]
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreContentOptions {
    /// Revision the new content is likely derived from
    pub base_revision: Option<RevisionId>,
    /// Fail with `ContentRequired` on empty content
    pub require_content: bool,
}

impl StoreContentOptions {
    pub fn with_base(base_revision: Option<RevisionId>) -> Self {
        Self {
            base_revision,
            ..Default::default()
        }
    }
}

/// Whether an edit script is small enough to be stored instead of full content
pub fn accepts_diff(script_len: usize, base_len: usize, divisor: u64) -> bool {
    (script_len as u128) * (divisor as u128) < base_len as u128
}

/// Blob used to rebuild `revision`, checked against its own hash and length
fn verified_blob(revision: &Revision, blob: Blob) -> Result<Blob> {
    if blob.is_consistent() {
        return Ok(blob);
    }
    let actual = digest(&blob.content);
    tracing::warn!(
        "Blob {} of revision {} is damaged: expected {}, got {}",
        blob.id,
        revision.id,
        blob.hash,
        actual
    );
    Err(VcsError::Integrity {
        revision: revision.id,
        expected: blob.hash,
        actual,
    })
}

/// Stores and reconstructs revision content
#[derive(Clone)]
pub struct RevisionManager {
    store: Arc<dyn VersionStore>,
    config: RevisionConfig,
}

impl RevisionManager {
    pub fn new(store: Arc<dyn VersionStore>, config: RevisionConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn VersionStore> {
        &self.store
    }

    pub fn config(&self) -> &RevisionConfig {
        &self.config
    }

    /// Store `content` as a revision, deduplicated by hash
    pub async fn store_content(
        &self,
        content: Bytes,
        options: StoreContentOptions,
    ) -> Result<Revision> {
        if content.is_empty() && (options.require_content || self.config.require_content) {
            return Err(VcsError::ContentRequired);
        }

        let store = self.store.as_ref();
        with_transaction(store, TxMode::Write, move || async move {
            let hash = digest(&content);
            let length = content.len() as u64;

            if let Some(existing) = store.get_revision_by_hash(&hash).await? {
                if existing.length != length {
                    return Err(VcsError::RevisionLengthMismatch {
                        hash,
                        existing: existing.length,
                        requested: length,
                    });
                }
                tracing::debug!("Content {} already stored as {}", hash, existing.id);
                return Ok(existing);
            }

            let mut script = None;
            if let Some(base_id) = options.base_revision {
                let base = self.load_revision(base_id).await?;
                let root = store
                    .get_blob(base.base_blob_id)
                    .await?
                    .ok_or(VcsError::BlobNotFound(base.base_blob_id))?;
                if !root.content.is_empty() {
                    let candidate = delta::diff(&root.content, &content);
                    let accepted = accepts_diff(
                        candidate.len(),
                        root.content.len(),
                        self.config.diff_threshold_divisor,
                    );
                    tracing::debug!(
                        "Diff against {} is {} bytes for {} bytes of content ({})",
                        root.id,
                        candidate.len(),
                        length,
                        if accepted { "accepted" } else { "rejected" }
                    );
                    if accepted {
                        script = Some((root.id, candidate));
                    }
                }
            }

            let (base_blob_id, diff_blob_id) = match script {
                Some((root_id, script)) => {
                    let diff_blob = store.put_blob(Bytes::from(script)).await?;
                    (root_id, Some(diff_blob.id))
                }
                None => (store.put_blob(content).await?.id, None),
            };

            store
                .put_revision(NewRevision {
                    length,
                    hash,
                    base_blob_id,
                    diff_blob_id,
                })
                .await
        })
        .await
    }

    /// Rebuild the full content of `revision` and verify it
    pub async fn reconstruct(&self, revision: &Revision) -> Result<Bytes> {
        let store = self.store.as_ref();
        let revision = *revision;
        with_transaction(store, TxMode::Read, move || async move {
            let base = store
                .get_blob(revision.base_blob_id)
                .await?
                .ok_or(VcsError::BlobNotFound(revision.base_blob_id))?;
            let base = verified_blob(&revision, base)?;

            let content = match revision.diff_blob_id {
                None => base.content,
                Some(diff_id) => {
                    let script = store
                        .get_blob(diff_id)
                        .await?
                        .ok_or(VcsError::BlobNotFound(diff_id))?;
                    let script = verified_blob(&revision, script)?;
                    Bytes::from(delta::patch(&base.content, &script.content)?)
                }
            };

            let actual = digest(&content);
            if actual != revision.hash || content.len() as u64 != revision.length {
                tracing::warn!(
                    "Revision {} failed verification: expected {} ({} bytes), got {} ({} bytes)",
                    revision.id,
                    revision.hash,
                    revision.length,
                    actual,
                    content.len()
                );
                return Err(VcsError::Integrity {
                    revision: revision.id,
                    expected: revision.hash,
                    actual,
                });
            }
            Ok(content)
        })
        .await
    }

    pub async fn load_revision(&self, id: RevisionId) -> Result<Revision> {
        self.store
            .get_revision(id)
            .await?
            .ok_or(VcsError::RevisionNotFound(id))
    }

    pub async fn find_by_hash(&self, hash: &ContentHash) -> Result<Option<Revision>> {
        self.store.get_revision_by_hash(hash).await
    }

    pub async fn load_content(&self, id: RevisionId) -> Result<Bytes> {
        let revision = self.load_revision(id).await?;
        self.reconstruct(&revision).await
    }

    /// Content of the revision with `hash`, if one exists
    pub async fn load_content_by_hash(&self, hash: &ContentHash) -> Result<Option<Bytes>> {
        match self.find_by_hash(hash).await? {
            Some(revision) => Ok(Some(self.reconstruct(&revision).await?)),
            None => Ok(None),
        }
    }

    /// Content decoded as UTF-8
    pub async fn load_string(&self, id: RevisionId) -> Result<String> {
        let content = self.load_content(id).await?;
        Ok(String::from_utf8(content.to_vec())?)
    }

    /// Content decoded as JSON
    pub async fn load_json<T: DeserializeOwned>(&self, id: RevisionId) -> Result<T> {
        let content = self.load_content(id).await?;
        Ok(serde_json::from_slice(&content)?)
    }
}

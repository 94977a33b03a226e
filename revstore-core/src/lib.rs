//! Revstore Core Library
//!
//! Storage engine for versioned resources:
//! - Content digests and a content-addressable blob store
//! - Binary delta codec (rolling-checksum diff and patch)
//! - Revisions stored in full or as a diff against their chain root
//! - Versions with changesets, commit seals and a parent DAG
//! - In-memory and SQLite store backends

pub mod config;
pub mod delta;
pub mod digest;
pub mod error;
pub mod memory_store;
pub mod model;
pub mod repository;
pub mod revision;
pub mod sqlite_store;
pub mod store;
pub mod version;

pub use config::{RevisionConfig, StoreConfig, CONFIG_FILE};
pub use digest::{digest, ContentHash};
pub use error::{Result, VcsError};
pub use memory_store::MemoryVersionStore;
pub use model::{
    Blob, BlobId, BlobRef, Changeset, NewRevision, PathId, PathQuery, ResourceEntry, Revision,
    RevisionId, Version, VersionId, VersionUpdate,
};
pub use repository::Repository;
pub use revision::{accepts_diff, RevisionManager, StoreContentOptions};
pub use sqlite_store::SqliteVersionStore;
pub use store::{with_transaction, TxGate, TxMode, TxOutcome, VersionStore};
pub use version::{
    merge_resource_lists, CommitInfo, CommitManifest, PutMode, ResourceFilter, VersionManager,
};

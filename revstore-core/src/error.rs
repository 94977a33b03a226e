//! Error taxonomy shared by the store boundary and the managers

use crate::digest::ContentHash;
use crate::model::{BlobId, RevisionId, VersionId};

/// Result type for every fallible revstore operation
pub type Result<T> = std::result::Result<T, VcsError>;

/// Errors that can occur in the storage engine
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    /// Reconstructed content does not match the recorded hash or length
    #[error("Integrity check failed for revision {revision}: expected {expected}, got {actual}")]
    Integrity {
        revision: RevisionId,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("Corrupt patch: {0}")]
    CorruptPatch(String),

    #[error("Version {0} is already committed")]
    AlreadyCommitted(VersionId),

    #[error("Version not found: {0}")]
    VersionNotFound(VersionId),

    #[error("Revision not found: {0}")]
    RevisionNotFound(RevisionId),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(BlobId),

    /// A revision or a version still references the blob
    #[error("Blob {0} is still referenced")]
    BlobInUse(BlobId),

    #[error("Content is required")]
    ContentRequired,

    /// A revision with this hash already exists with a different length
    #[error("Revision {hash} already stored with length {existing}, got {requested}")]
    RevisionLengthMismatch {
        hash: ContentHash,
        existing: u64,
        requested: u64,
    },

    #[error("Linking version {version} to parent {parent} would create a cycle")]
    CycleDetected { version: VersionId, parent: VersionId },

    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Content is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

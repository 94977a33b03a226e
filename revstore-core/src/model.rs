//! Core data model
//!
//! Plain records handed across the store boundary. Identifiers are opaque,
//! store-assigned, strictly positive integers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::digest::{digest, ContentHash};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Raw integer value
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a stored blob
    BlobId,
    "b"
);
id_type!(
    /// Identifier of an interned path
    PathId,
    "p"
);
id_type!(
    /// Identifier of a revision record
    RevisionId,
    "r"
);
id_type!(
    /// Identifier of a version
    VersionId,
    "v"
);

/// Path -> revision mapping owned by a version
pub type Changeset = BTreeMap<PathId, RevisionId>;

/// Stored, hash-addressed byte buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub id: BlobId,
    pub hash: ContentHash,
    pub length: u64,
    pub content: Bytes,
}

impl Blob {
    /// Metadata of this blob without its content
    pub fn to_ref(&self) -> BlobRef {
        BlobRef {
            id: self.id,
            hash: self.hash,
            length: self.length,
        }
    }

    /// Check `hash` and `length` against the content
    pub fn is_consistent(&self) -> bool {
        self.length == self.content.len() as u64 && self.hash == digest(&self.content)
    }
}

/// Blob metadata returned by `put_blob`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub id: BlobId,
    pub hash: ContentHash,
    pub length: u64,
}

/// One logical version of a resource's content
///
/// `hash` and `length` always describe the reconstructed content. Without a
/// diff blob the full content lives under `base_blob_id`; with one, the diff
/// was computed against exactly the bytes of `base_blob_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub id: RevisionId,
    pub length: u64,
    pub hash: ContentHash,
    pub base_blob_id: BlobId,
    pub diff_blob_id: Option<BlobId>,
}

impl Revision {
    /// Whether reconstruction needs a patch step
    pub fn is_diff(&self) -> bool {
        self.diff_blob_id.is_some()
    }
}

/// Revision fields supplied to `put_revision`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewRevision {
    pub length: u64,
    pub hash: ContentHash,
    pub base_blob_id: BlobId,
    pub diff_blob_id: Option<BlobId>,
}

/// Version record
///
/// A version is committed once it carries a metadata blob; `seal` is the hash
/// of that blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    /// Creation timestamp, milliseconds since the Unix epoch
    pub stamp: i64,
    pub metadata_id: Option<BlobId>,
    pub seal: Option<ContentHash>,
}

impl Version {
    pub fn is_committed(&self) -> bool {
        self.metadata_id.is_some()
    }
}

/// Fields for `put_version`; `id: None` creates a new version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionUpdate {
    pub id: Option<VersionId>,
    pub stamp: Option<i64>,
    pub metadata_id: Option<BlobId>,
}

/// Path lookup request for `resolve_paths`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathQuery {
    Paths(Vec<String>),
    Ids(Vec<PathId>),
}

/// A changeset entry resolved to its path string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub path: String,
    pub path_id: PathId,
    pub revision: Revision,
}

/// Current wall-clock time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(BlobId(3).to_string(), "b3");
        assert_eq!(VersionId(12).to_string(), "v12");
        assert_eq!(RevisionId(7).get(), 7);
    }

    #[test]
    fn test_blob_consistency() {
        let content = Bytes::from_static(b"This is a content");
        let mut blob = Blob {
            id: BlobId(1),
            hash: digest(&content),
            length: content.len() as u64,
            content,
        };
        assert!(blob.is_consistent());
        assert_eq!(blob.to_ref().length, 17);

        blob.length = 3;
        assert!(!blob.is_consistent());
    }

    #[test]
    fn test_version_committed_flag() {
        let mut version = Version {
            id: VersionId(1),
            stamp: now_millis(),
            metadata_id: None,
            seal: None,
        };
        assert!(!version.is_committed());
        version.metadata_id = Some(BlobId(9));
        assert!(version.is_committed());
    }
}

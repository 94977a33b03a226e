//! Content digests
//!
//! Every blob and revision is identified by the SHA-1 of its full content,
//! rendered as 40 lowercase hex characters when persisted.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::VcsError;

/// Length of a digest in bytes
pub const HASH_LEN: usize = 20;

/// Length of a digest rendered as hex
pub const HASH_HEX_LEN: usize = HASH_LEN * 2;

/// Fixed-width identifier of a byte sequence
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Create a hash from raw digest bytes
    pub fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash of the empty byte sequence
    pub fn empty() -> Self {
        digest(&[])
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 40 character hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, VcsError> {
        if hex_str.len() != HASH_HEX_LEN {
            return Err(VcsError::InvalidHash(hex_str.to_string()));
        }
        let bytes = hex::decode(hex_str).map_err(|_| VcsError::InvalidHash(hex_str.to_string()))?;
        let mut arr = [0u8; HASH_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

/// Compute the content hash of `data`
pub fn digest(data: &[u8]) -> ContentHash {
    ContentHash(Sha1::digest(data).into())
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl std::str::FromStr for ContentHash {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

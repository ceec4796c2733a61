//! Key encoding and decoding for storage layer.
//!
//! Key format: `version:{indexer_id}`. Indexer IDs may contain any
//! character, including `:`; everything after the first separator is the ID.

use crate::error::StorageError;

const VERSION_PREFIX: &str = "version:";

/// Key for indexer version checkpoints
/// Format: version:{indexer_id}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionKey {
    /// Indexer identity
    pub indexer_id: String,
}

impl VersionKey {
    pub fn new(indexer_id: impl Into<String>) -> Self {
        Self {
            indexer_id: indexer_id.into(),
        }
    }

    /// Encode key to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{}{}", VERSION_PREFIX, self.indexer_id).into_bytes()
    }

    /// Decode key from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;

        let indexer_id = s
            .strip_prefix(VERSION_PREFIX)
            .ok_or_else(|| StorageError::Key(format!("Invalid version key format: {}", s)))?;

        Ok(Self::new(indexer_id))
    }

    /// Prefix shared by every version key, for full scans
    pub fn prefix() -> &'static [u8] {
        VERSION_PREFIX.as_bytes()
    }
}

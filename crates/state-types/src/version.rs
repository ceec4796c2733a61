//! Indexer versions and the durable version checkpoint.
//!
//! A `VersionRecord` stores the last indexer version whose full reindex
//! completed, enabling crash recovery: on restart a declared version above
//! the record means the projection must be rebuilt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// Version declared by an indexer's code.
pub type Version = u64;

/// Durable checkpoint for one indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Indexer identity
    pub indexer_id: String,

    /// Last version promoted by a successful reindex
    pub last_indexed_version: Version,

    /// When the record was last written (milliseconds since epoch for JSON compatibility)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl VersionRecord {
    /// Create a record stamped with the current time.
    pub fn new(indexer_id: impl Into<String>, last_indexed_version: Version) -> Self {
        Self {
            indexer_id: indexer_id.into(),
            last_indexed_version,
            updated_at: Utc::now(),
        }
    }

    /// Serialize to JSON bytes for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        serde_json::to_vec(self).map_err(TypesError::from)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        serde_json::from_slice(bytes).map_err(TypesError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_record_json_format() {
        let record = VersionRecord::new("idx1", 3);
        let json_str = String::from_utf8(record.to_bytes().unwrap()).unwrap();

        assert!(json_str.contains("\"indexer_id\":\"idx1\""));
        assert!(json_str.contains("\"last_indexed_version\":3"));
        assert!(json_str.contains("\"updated_at\":"));
    }

    #[test]
    fn test_version_record_decode_keeps_millis() {
        let record = VersionRecord::new("idx2", 9);
        let decoded = VersionRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.indexer_id, "idx2");
        assert_eq!(decoded.last_indexed_version, 9);
        assert_eq!(
            record.updated_at.timestamp_millis(),
            decoded.updated_at.timestamp_millis()
        );
    }

    #[test]
    fn test_version_record_rejects_garbage() {
        assert!(VersionRecord::from_bytes(b"not json").is_err());
    }
}

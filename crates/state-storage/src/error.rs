//! Storage layer error types.

use state_types::TypesError;
use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// RocksDB operation failed
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Column family not found
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// Key encoding/decoding error
    #[error("Key error: {0}")]
    Key(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Attempt to move a checkpoint backwards
    #[error("Version regression for {indexer_id}: stored {stored}, requested {requested}")]
    VersionRegression {
        indexer_id: String,
        stored: u64,
        requested: u64,
    },
}

impl From<TypesError> for StorageError {
    fn from(err: TypesError) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regression_display() {
        let err = StorageError::VersionRegression {
            indexer_id: "idx1".to_string(),
            stored: 3,
            requested: 2,
        };
        assert_eq!(
            err.to_string(),
            "Version regression for idx1: stored 3, requested 2"
        );
    }
}

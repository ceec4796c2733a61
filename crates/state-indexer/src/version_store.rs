//! Durable per-indexer version checkpoints.
//!
//! Only the coordinator writes checkpoints, and only after an indexer
//! promoted a new generation. Checkpoints never move backwards.

use std::collections::BTreeMap;
use std::sync::RwLock;

use state_storage::Storage;
use state_types::{Version, VersionRecord};

use crate::error::IndexingError;

/// Key-value durability for indexer checkpoints.
pub trait VersionStore: Send + Sync {
    /// Last version successfully indexed, if any.
    fn get(&self, indexer_id: &str) -> Result<Option<Version>, IndexingError>;

    /// Durably record `version` before returning.
    ///
    /// A lower version than the stored one fails with `VersionRegression`.
    fn set(&self, indexer_id: &str, version: Version) -> Result<(), IndexingError>;

    /// Every stored checkpoint in indexer ID order.
    fn all(&self) -> Result<Vec<VersionRecord>, IndexingError>;
}

impl VersionStore for Storage {
    fn get(&self, indexer_id: &str) -> Result<Option<Version>, IndexingError> {
        Ok(self
            .get_indexer_version(indexer_id)?
            .map(|r| r.last_indexed_version))
    }

    fn set(&self, indexer_id: &str, version: Version) -> Result<(), IndexingError> {
        self.put_indexer_version(indexer_id, version)?;
        Ok(())
    }

    fn all(&self) -> Result<Vec<VersionRecord>, IndexingError> {
        Ok(self.list_indexer_versions()?)
    }
}

/// Volatile checkpoint store for tests.
#[derive(Default)]
pub struct MemoryVersionStore {
    records: RwLock<BTreeMap<String, VersionRecord>>,
}

impl MemoryVersionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl VersionStore for MemoryVersionStore {
    fn get(&self, indexer_id: &str) -> Result<Option<Version>, IndexingError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(indexer_id)
            .map(|r| r.last_indexed_version))
    }

    fn set(&self, indexer_id: &str, version: Version) -> Result<(), IndexingError> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = records.get(indexer_id) {
            if version < existing.last_indexed_version {
                return Err(IndexingError::VersionRegression {
                    indexer_id: indexer_id.to_string(),
                    stored: existing.last_indexed_version,
                    requested: version,
                });
            }
            if version == existing.last_indexed_version {
                return Ok(());
            }
        }

        records.insert(
            indexer_id.to_string(),
            VersionRecord::new(indexer_id, version),
        );
        Ok(())
    }

    fn all(&self) -> Result<Vec<VersionRecord>, IndexingError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn check_store(store: &dyn VersionStore) {
        assert_eq!(store.get("idx").unwrap(), None);

        store.set("idx", 1).unwrap();
        store.set("idx", 3).unwrap();
        assert_eq!(store.get("idx").unwrap(), Some(3));

        store.set("idx", 3).unwrap();
        let err = store.set("idx", 2).unwrap_err();
        assert!(matches!(
            err,
            IndexingError::VersionRegression {
                stored: 3,
                requested: 2,
                ..
            }
        ));
        assert_eq!(store.get("idx").unwrap(), Some(3));

        store.set("another", 1).unwrap();
        let ids: Vec<_> = store
            .all()
            .unwrap()
            .into_iter()
            .map(|r| r.indexer_id)
            .collect();
        assert_eq!(ids, vec!["another", "idx"]);
    }

    #[test]
    fn test_memory_version_store() {
        check_store(&MemoryVersionStore::new());
    }

    #[test]
    fn test_rocksdb_version_store() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        check_store(&storage);
    }

    #[test]
    fn test_rocksdb_version_store_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        {
            let storage = Storage::open(temp_dir.path()).unwrap();
            VersionStore::set(&storage, "idx1", 4).unwrap();
        }
        let storage = Storage::open(temp_dir.path()).unwrap();
        assert_eq!(VersionStore::get(&storage, "idx1").unwrap(), Some(4));
    }
}

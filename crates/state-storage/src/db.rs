//! RocksDB wrapper for state-indexer storage.
//!
//! Provides:
//! - Database open/close with column family setup
//! - Durable version checkpoint reads and writes
//! - Monotonic checkpoint enforcement

use rocksdb::{Direction, IteratorMode, Options, WriteOptions, DB};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::column_families::{build_cf_descriptors, CF_INDEXER_VERSIONS};
use crate::error::StorageError;
use crate::keys::VersionKey;
use state_types::{Version, VersionRecord};

/// Main storage interface for the state indexer
pub struct Storage {
    db: DB,
    /// Serializes read-check-write of checkpoints
    write_guard: Mutex<()>,
}

impl Storage {
    /// Open storage at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening storage at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors = build_cf_descriptors();
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        Ok(Self {
            db,
            write_guard: Mutex::new(()),
        })
    }

    fn versions_cf(&self) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(CF_INDEXER_VERSIONS)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_INDEXER_VERSIONS.to_string()))
    }

    /// Get the checkpoint of an indexer, if one was ever written
    pub fn get_indexer_version(
        &self,
        indexer_id: &str,
    ) -> Result<Option<VersionRecord>, StorageError> {
        let cf = self.versions_cf()?;
        let key = VersionKey::new(indexer_id);
        match self.db.get_cf(cf, key.to_bytes())? {
            Some(bytes) => Ok(Some(VersionRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Durably store the checkpoint of an indexer.
    ///
    /// The write is synced to disk before returning. Writing a version lower
    /// than the stored one fails with `VersionRegression`; writing the same
    /// version again is a no-op.
    pub fn put_indexer_version(
        &self,
        indexer_id: &str,
        version: Version,
    ) -> Result<VersionRecord, StorageError> {
        let _guard = self
            .write_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = self.get_indexer_version(indexer_id)? {
            if version < existing.last_indexed_version {
                return Err(StorageError::VersionRegression {
                    indexer_id: indexer_id.to_string(),
                    stored: existing.last_indexed_version,
                    requested: version,
                });
            }
            if version == existing.last_indexed_version {
                debug!(indexer = %indexer_id, version, "Checkpoint unchanged");
                return Ok(existing);
            }
        }

        let cf = self.versions_cf()?;
        let record = VersionRecord::new(indexer_id, version);
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.put_cf_opt(
            cf,
            VersionKey::new(indexer_id).to_bytes(),
            record.to_bytes()?,
            &write_opts,
        )?;

        debug!(indexer = %indexer_id, version, "Stored checkpoint");
        Ok(record)
    }

    /// List every stored checkpoint in indexer ID order
    pub fn list_indexer_versions(&self) -> Result<Vec<VersionRecord>, StorageError> {
        let cf = self.versions_cf()?;
        let prefix = VersionKey::prefix();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut records = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            records.push(VersionRecord::from_bytes(&value)?);
        }
        Ok(records)
    }
}

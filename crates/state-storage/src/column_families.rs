//! Column family definitions for RocksDB.
//!
//! - indexer_versions: one `VersionRecord` per indexer (default compaction)

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for indexer version checkpoints
pub const CF_INDEXER_VERSIONS: &str = "indexer_versions";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[CF_INDEXER_VERSIONS];

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![ColumnFamilyDescriptor::new(
        CF_INDEXER_VERSIONS,
        Options::default(),
    )]
}

//! Storage layer for the state indexer.
//!
//! Provides RocksDB-backed durable storage for indexer version checkpoints:
//! - Column family isolation for checkpoint records
//! - Synchronous (fsync'd) writes so a returned `Ok` survives a crash
//! - Monotonic checkpoints: a stored version never decreases

pub mod column_families;
pub mod db;
pub mod error;
pub mod keys;

pub use db::Storage;
pub use error::StorageError;
pub use keys::VersionKey;

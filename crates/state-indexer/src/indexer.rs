//! The indexer plugin contract.
//!
//! Every projection of primary state (search index, cache, materialized
//! view) implements [`Indexer`]. The coordinator and the dispatcher only
//! ever talk to indexers through this trait.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::warn;

use state_types::{StateId, StateRecord, Subscription, Version};

use crate::error::IndexingError;

/// Per-record failures reported by an otherwise successful `index` call.
pub type StateErrors = HashMap<StateId, String>;

/// Trait implemented by every pluggable indexer.
///
/// `index` must be idempotent and last-version-wins per key: applying a
/// record whose version is not newer than the one already applied for the
/// same key is a no-op. The same record may arrive once through a bulk
/// snapshot and again through replay.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Stable, globally unique identity.
    fn id(&self) -> &str;

    /// Version declared by the current code; an increase requires a reindex.
    fn version(&self) -> Version;

    /// State this indexer wants to receive. Empty means never dispatched to.
    fn subscriptions(&self) -> Vec<Subscription>;

    /// Stage storage for generation `to` without disturbing readers of the
    /// current one. `is_first` is set when no generation was ever promoted.
    async fn prepare_reindex(
        &self,
        from: Version,
        to: Version,
        is_first: bool,
    ) -> Result<(), IndexingError>;

    /// Apply records to the active target generation.
    async fn index(&self, records: &[StateRecord]) -> Result<StateErrors, IndexingError>;

    /// Atomically promote the staged generation `to` to be served.
    async fn complete_reindex(&self, from: Version, to: Version) -> Result<(), IndexingError>;

    /// Drop whatever `prepare_reindex` staged for `to` after a failed attempt.
    async fn abort_reindex(&self, _to: Version) -> Result<(), IndexingError> {
        Ok(())
    }
}

/// Log the per-record failures of one `index` call.
pub(crate) fn log_state_errors(indexer_id: &str, errors: &StateErrors) {
    for (state_id, error) in errors {
        warn!(
            indexer = %indexer_id,
            state = %state_id,
            error = %error,
            "Indexer rejected record"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopIndexer;

    #[async_trait]
    impl Indexer for NoopIndexer {
        fn id(&self) -> &str {
            "noop"
        }

        fn version(&self) -> Version {
            1
        }

        fn subscriptions(&self) -> Vec<Subscription> {
            Vec::new()
        }

        async fn prepare_reindex(&self, _: Version, _: Version, _: bool) -> Result<(), IndexingError> {
            Ok(())
        }

        async fn index(&self, records: &[StateRecord]) -> Result<StateErrors, IndexingError> {
            Ok(records
                .iter()
                .filter(|r| r.value.is_empty() && !r.deleted)
                .map(|r| (r.id(), "empty value".to_string()))
                .collect())
        }

        async fn complete_reindex(&self, _: Version, _: Version) -> Result<(), IndexingError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_abort_defaults_to_noop() {
        assert!(NoopIndexer.abort_reindex(2).await.is_ok());
    }

    #[tokio::test]
    async fn test_per_record_errors_keyed_by_state() {
        let records = vec![
            StateRecord::new("device", "d1", b"ok".to_vec(), 1),
            StateRecord::new("device", "d2", Vec::new(), 1),
            StateRecord::tombstone("device", "d3", 2),
        ];
        let errors = NoopIndexer.index(&records).await.unwrap();
        log_state_errors("noop", &errors);

        assert_eq!(errors.len(), 1);
        assert!(errors.contains_key(&StateId::new("device", "d2")));
    }
}

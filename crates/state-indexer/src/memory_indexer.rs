//! In-memory reference projection.
//!
//! Keeps one serving generation and, during a reindex, one staging
//! generation. Readers always see the serving generation; promotion swaps
//! the two under a single write lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, info};

use state_types::{StateId, StateRecord, Subscription, Version};

use crate::error::IndexingError;
use crate::indexer::{Indexer, StateErrors};

/// One projected key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedEntry {
    /// Version of the record that produced this entry
    pub version: u64,
    /// Projected value
    pub value: Vec<u8>,
    /// Tombstone marker
    pub deleted: bool,
}

type Generation = HashMap<StateId, ProjectedEntry>;

#[derive(Default)]
struct Generations {
    serving: Generation,
    serving_version: Version,
    staging: Option<(Version, Generation)>,
}

/// Last-version-wins upsert. Returns whether the entry changed.
fn apply(generation: &mut Generation, record: &StateRecord) -> bool {
    let id = record.id();
    if let Some(existing) = generation.get(&id) {
        if existing.version >= record.version {
            return false;
        }
    }
    generation.insert(
        id,
        ProjectedEntry {
            version: record.version,
            value: record.value.clone(),
            deleted: record.deleted,
        },
    );
    true
}

/// Projection of subscribed state into a key-value map.
pub struct MemoryIndexer {
    id: String,
    version: AtomicU64,
    subscriptions: Vec<Subscription>,
    generations: RwLock<Generations>,
}

impl MemoryIndexer {
    /// Create an indexer with no generation promoted yet.
    pub fn new(id: impl Into<String>, version: Version, subscriptions: Vec<Subscription>) -> Self {
        Self {
            id: id.into(),
            version: AtomicU64::new(version),
            subscriptions,
            generations: RwLock::new(Generations::default()),
        }
    }

    /// Declare a new code version, as an upgraded deployment would.
    pub fn set_version(&self, version: Version) {
        self.version.store(version, Ordering::SeqCst);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Generations> {
        self.generations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Generations> {
        self.generations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Live value served for a key.
    pub fn get(&self, state_type: &str, key: &str) -> Option<Vec<u8>> {
        self.read()
            .serving
            .get(&StateId::new(state_type, key))
            .filter(|e| !e.deleted)
            .map(|e| e.value.clone())
    }

    /// Highest version applied for a key in the serving generation,
    /// tombstones included.
    pub fn observed_version(&self, state_type: &str, key: &str) -> Option<u64> {
        self.read()
            .serving
            .get(&StateId::new(state_type, key))
            .map(|e| e.version)
    }

    /// Number of live keys served.
    pub fn len(&self) -> usize {
        self.read().serving.values().filter(|e| !e.deleted).count()
    }

    /// Check if nothing is served.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Version of the generation being served (0 before the first promotion).
    pub fn serving_version(&self) -> Version {
        self.read().serving_version
    }

    /// Whether a generation is staged.
    pub fn is_staging(&self) -> bool {
        self.read().staging.is_some()
    }
}

#[async_trait]
impl Indexer for MemoryIndexer {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> Version {
        self.version.load(Ordering::SeqCst)
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.clone()
    }

    async fn prepare_reindex(
        &self,
        from: Version,
        to: Version,
        is_first: bool,
    ) -> Result<(), IndexingError> {
        let mut generations = self.write();
        if generations.staging.is_some() {
            debug!(indexer = %self.id, "Discarding stale staging generation");
        }
        generations.staging = Some((to, Generation::new()));
        info!(indexer = %self.id, from, to, is_first, "Staged new generation");
        Ok(())
    }

    async fn index(&self, records: &[StateRecord]) -> Result<StateErrors, IndexingError> {
        let mut generations = self.write();
        let generations = &mut *generations;
        let target = match generations.staging.as_mut() {
            Some((_, staging)) => staging,
            None => &mut generations.serving,
        };

        let applied = records.iter().filter(|r| apply(target, r)).count();
        debug!(
            indexer = %self.id,
            records = records.len(),
            applied,
            "Applied records"
        );
        Ok(StateErrors::new())
    }

    async fn complete_reindex(&self, from: Version, to: Version) -> Result<(), IndexingError> {
        let mut generations = self.write();
        match generations.staging.take() {
            Some((version, staging)) if version == to => {
                generations.serving = staging;
                generations.serving_version = to;
                info!(indexer = %self.id, from, to, "Promoted generation");
                Ok(())
            }
            Some((version, staging)) => {
                generations.staging = Some((version, staging));
                Err(IndexingError::CompleteFailed {
                    indexer_id: self.id.clone(),
                    reason: format!("staged generation is {}, asked to promote {}", version, to),
                })
            }
            None => Err(IndexingError::CompleteFailed {
                indexer_id: self.id.clone(),
                reason: "no staged generation".to_string(),
            }),
        }
    }

    async fn abort_reindex(&self, to: Version) -> Result<(), IndexingError> {
        let mut generations = self.write();
        if matches!(generations.staging, Some((version, _)) if version == to) {
            generations.staging = None;
            info!(indexer = %self.id, to, "Dropped staged generation");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, value: &str, version: u64) -> StateRecord {
        StateRecord::new("device", key, value.as_bytes().to_vec(), version)
    }

    #[tokio::test]
    async fn test_last_version_wins() {
        let idx = MemoryIndexer::new("idx", 1, vec![Subscription::all("device")]);

        idx.index(&[record("d1", "v3", 3)]).await.unwrap();
        idx.index(&[record("d1", "v2", 2)]).await.unwrap();
        idx.index(&[record("d1", "v3-again", 3)]).await.unwrap();

        assert_eq!(idx.get("device", "d1"), Some(b"v3".to_vec()));
        assert_eq!(idx.observed_version("device", "d1"), Some(3));
    }

    #[tokio::test]
    async fn test_tombstone_hides_value() {
        let idx = MemoryIndexer::new("idx", 1, vec![Subscription::all("device")]);
        idx.index(&[record("d1", "a", 1)]).await.unwrap();
        idx.index(&[StateRecord::tombstone("device", "d1", 2)])
            .await
            .unwrap();

        assert_eq!(idx.get("device", "d1"), None);
        assert_eq!(idx.observed_version("device", "d1"), Some(2));
        assert!(idx.is_empty());

        // A stale write cannot resurrect the key
        idx.index(&[record("d1", "a", 1)]).await.unwrap();
        assert_eq!(idx.get("device", "d1"), None);
    }

    #[tokio::test]
    async fn test_staging_invisible_until_promoted() {
        let idx = MemoryIndexer::new("idx", 2, vec![Subscription::all("device")]);
        idx.index(&[record("d1", "old", 1)]).await.unwrap();

        idx.prepare_reindex(1, 2, false).await.unwrap();
        assert!(idx.is_staging());
        idx.index(&[record("d2", "new", 1)]).await.unwrap();

        assert_eq!(idx.get("device", "d1"), Some(b"old".to_vec()));
        assert_eq!(idx.get("device", "d2"), None);

        idx.complete_reindex(1, 2).await.unwrap();
        assert!(!idx.is_staging());
        assert_eq!(idx.serving_version(), 2);
        assert_eq!(idx.get("device", "d1"), None);
        assert_eq!(idx.get("device", "d2"), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_abort_keeps_old_generation() {
        let idx = MemoryIndexer::new("idx", 2, vec![Subscription::all("device")]);
        idx.index(&[record("d1", "old", 1)]).await.unwrap();

        idx.prepare_reindex(1, 2, false).await.unwrap();
        idx.index(&[record("d2", "new", 1)]).await.unwrap();
        idx.abort_reindex(2).await.unwrap();

        assert!(!idx.is_staging());
        idx.index(&[record("d1", "newer", 2)]).await.unwrap();
        assert_eq!(idx.get("device", "d1"), Some(b"newer".to_vec()));
        assert_eq!(idx.get("device", "d2"), None);
    }

    #[tokio::test]
    async fn test_complete_without_staging_fails() {
        let idx = MemoryIndexer::new("idx", 1, Vec::new());
        let err = idx.complete_reindex(0, 1).await.unwrap_err();
        assert!(matches!(err, IndexingError::CompleteFailed { .. }));

        idx.prepare_reindex(0, 1, true).await.unwrap();
        let err = idx.complete_reindex(0, 2).await.unwrap_err();
        assert!(matches!(err, IndexingError::CompleteFailed { .. }));
        assert!(idx.is_staging());
    }

    #[test]
    fn test_set_version() {
        let idx = MemoryIndexer::new("idx", 1, Vec::new());
        idx.set_version(3);
        assert_eq!(idx.version(), 3);
    }
}

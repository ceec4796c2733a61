//! The primary state store, as seen by the indexing core.
//!
//! The store itself lives outside this crate; [`StateStore`] is the slice of
//! it the coordinator and dispatcher consume. [`MemoryStateStore`] is an
//! in-process implementation used by tests and embedders.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use state_types::{KeyMatcher, StateChangeEvent, StateId, StateRecord};

use crate::error::IndexingError;

/// Ordered stream of state changes for one feed shard.
pub type ChangeFeed = mpsc::UnboundedReceiver<StateChangeEvent>;

/// Read side of the primary state store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// List records of one type in ascending key order.
    ///
    /// Returns at most `limit` records with keys strictly greater than
    /// `after_key`, filtered by `key_pattern` when given. Deleted keys are
    /// listed as tombstones so a rebuilt generation knows their deletion
    /// version and rejects older redelivered writes.
    async fn list_snapshot(
        &self,
        state_type: &str,
        key_pattern: Option<&KeyMatcher>,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StateRecord>, IndexingError>;

    /// Open a new change feed starting at the next change.
    async fn subscribe(&self) -> Result<ChangeFeed, IndexingError>;
}

#[derive(Default)]
struct MemoryInner {
    records: BTreeMap<StateId, StateRecord>,
    versions: HashMap<StateId, u64>,
    subscribers: Vec<mpsc::UnboundedSender<StateChangeEvent>>,
}

impl MemoryInner {
    fn next_version(&mut self, id: &StateId) -> u64 {
        let version = self.versions.entry(id.clone()).or_insert(0);
        *version += 1;
        *version
    }

    fn publish(&mut self, event: StateChangeEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

/// In-memory state store.
///
/// Versions are assigned per key, starting at 1 and increasing on every
/// write, deletes included. Changes are published to subscribers while the
/// write lock is held, so every feed observes the same order.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
    snapshot_calls: AtomicUsize,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write a value and return the record as stored.
    pub fn put(
        &self,
        state_type: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> StateRecord {
        let id = StateId::new(state_type, key);
        let mut inner = self.lock();
        let version = inner.next_version(&id);
        let record = StateRecord::new(id.state_type.clone(), id.key.clone(), value, version);
        inner.records.insert(id, record.clone());
        inner.publish(StateChangeEvent::from(record.clone()));
        record
    }

    /// Write a value at an explicit version.
    ///
    /// Later automatic versions continue above it. Returns `None` and leaves
    /// the store untouched if `version` is not above the current one.
    pub fn put_at(
        &self,
        state_type: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
        version: u64,
    ) -> Option<StateRecord> {
        let id = StateId::new(state_type, key);
        let mut inner = self.lock();
        let current = inner.versions.get(&id).copied().unwrap_or(0);
        if version <= current {
            return None;
        }
        inner.versions.insert(id.clone(), version);
        let record = StateRecord::new(id.state_type.clone(), id.key.clone(), value, version);
        inner.records.insert(id, record.clone());
        inner.publish(StateChangeEvent::from(record.clone()));
        Some(record)
    }

    /// Delete a key and return the tombstone, or `None` if it was absent.
    pub fn delete(&self, state_type: &str, key: &str) -> Option<StateRecord> {
        let id = StateId::new(state_type, key);
        let mut inner = self.lock();
        let live = inner
            .records
            .get(&id)
            .map(|r| !r.deleted)
            .unwrap_or(false);
        if !live {
            return None;
        }
        let version = inner.next_version(&id);
        let tombstone = StateRecord::tombstone(state_type, key, version);
        inner.records.insert(id, tombstone.clone());
        inner.publish(StateChangeEvent::from(tombstone.clone()));
        Some(tombstone)
    }

    /// Get the live record for a key.
    pub fn get(&self, state_type: &str, key: &str) -> Option<StateRecord> {
        self.lock()
            .records
            .get(&StateId::new(state_type, key))
            .filter(|r| !r.deleted)
            .cloned()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.lock().records.values().filter(|r| !r.deleted).count()
    }

    /// Check if no live record exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `list_snapshot` calls served so far.
    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    /// Number of open change feeds.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|s| !s.is_closed());
        inner.subscribers.len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn list_snapshot(
        &self,
        state_type: &str,
        key_pattern: Option<&KeyMatcher>,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StateRecord>, IndexingError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);

        let lower = match after_key {
            Some(key) => Bound::Excluded(StateId::new(state_type, key)),
            None => Bound::Included(StateId::new(state_type, "")),
        };

        let inner = self.lock();
        let page: Vec<StateRecord> = inner
            .records
            .range((lower, Bound::Unbounded))
            .take_while(|(id, _)| id.state_type == state_type)
            .filter(|(id, _)| key_pattern.map(|m| m.matches(&id.key)).unwrap_or(true))
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect();

        debug!(
            state_type,
            after_key = after_key.unwrap_or(""),
            returned = page.len(),
            "Listed snapshot page"
        );
        Ok(page)
    }

    async fn subscribe(&self) -> Result<ChangeFeed, IndexingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_assigns_increasing_versions() {
        let store = MemoryStateStore::new();
        assert_eq!(store.put("device", "d1", b"a".to_vec()).version, 1);
        assert_eq!(store.put("device", "d1", b"b".to_vec()).version, 2);
        assert_eq!(store.put("device", "d2", b"c".to_vec()).version, 1);
        assert_eq!(store.get("device", "d1").unwrap().value, b"b".to_vec());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_put_at_rejects_stale_version() {
        let store = MemoryStateStore::new();
        store.put_at("device", "d1", b"x".to_vec(), 5).unwrap();
        assert!(store.put_at("device", "d1", b"y".to_vec(), 5).is_none());
        assert_eq!(store.put("device", "d1", b"z".to_vec()).version, 6);
    }

    #[test]
    fn test_delete_produces_tombstone() {
        let store = MemoryStateStore::new();
        store.put("device", "d1", b"a".to_vec());
        let tombstone = store.delete("device", "d1").unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.version, 2);
        assert!(store.get("device", "d1").is_none());
        assert!(store.delete("device", "d1").is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_paging_in_key_order() {
        let store = MemoryStateStore::new();
        for key in ["d3", "d1", "d2", "d4"] {
            store.put("device", key, b"v".to_vec());
        }
        store.put("gateway", "g1", b"v".to_vec());
        store.put("device", "d5", b"v".to_vec());
        store.delete("device", "d5");

        let page = store.list_snapshot("device", None, None, 3).await.unwrap();
        let keys: Vec<_> = page.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["d1", "d2", "d3"]);

        let page = store
            .list_snapshot("device", None, Some("d3"), 3)
            .await
            .unwrap();
        let keys: Vec<_> = page.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["d4", "d5"]);
        assert!(!page[0].deleted);
        assert!(page[1].deleted);
        assert_eq!(page[1].version, 2);
        assert_eq!(store.snapshot_calls(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_applies_key_pattern() {
        let store = MemoryStateStore::new();
        store.put("device", "lte-1", b"v".to_vec());
        store.put("device", "wifi-1", b"v".to_vec());
        store.put("device", "lte-2", b"v".to_vec());

        let prefix = KeyMatcher::prefix("lte-");
        let page = store
            .list_snapshot("device", Some(&prefix), None, 10)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);

        let exact = KeyMatcher::exact("wifi-1");
        let page = store
            .list_snapshot("device", Some(&exact), None, 10)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes_in_order() {
        let store = MemoryStateStore::new();
        let mut feed = store.subscribe().await.unwrap();

        store.put("device", "d1", b"a".to_vec());
        store.put("device", "d1", b"b".to_vec());
        store.delete("device", "d1");

        let versions: Vec<_> = [
            feed.recv().await.unwrap(),
            feed.recv().await.unwrap(),
            feed.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| (e.version, e.deleted))
        .collect();
        assert_eq!(versions, vec![(1, false), (2, false), (3, true)]);
    }

    #[tokio::test]
    async fn test_closed_feeds_are_dropped() {
        let store = MemoryStateStore::new();
        let feed = store.subscribe().await.unwrap();
        assert_eq!(store.subscriber_count(), 1);
        drop(feed);
        store.put("device", "d1", b"a".to_vec());
        assert_eq!(store.subscriber_count(), 0);
    }
}

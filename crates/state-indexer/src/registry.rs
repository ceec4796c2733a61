//! Indexer registry.
//!
//! Catalog of registered indexers keyed by ID. Owns the current
//! [`SubscriptionMatcher`] and announces registrations so the coordinator
//! can schedule reindexing of new or upgraded indexers.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, info};

use state_types::{Subscription, Version};

use crate::error::IndexingError;
use crate::indexer::Indexer;
use crate::matcher::SubscriptionMatcher;

/// Buffered registration announcements per receiver.
const REGISTRATION_CHANNEL_CAPACITY: usize = 256;

struct Entry {
    indexer: Arc<dyn Indexer>,
    reindexing: bool,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    matcher: Arc<SubscriptionMatcher>,
}

/// Thread-safe catalog of indexers.
pub struct IndexerRegistry {
    inner: RwLock<Inner>,
    registrations: broadcast::Sender<String>,
}

/// Version plus the sorted, deduplicated subscription set.
fn capabilities(indexer: &dyn Indexer) -> (Version, Vec<Subscription>) {
    let mut subscriptions = indexer.subscriptions();
    subscriptions.sort();
    subscriptions.dedup();
    (indexer.version(), subscriptions)
}

fn same_instance(a: &Arc<dyn Indexer>, b: &Arc<dyn Indexer>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl IndexerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (registrations, _) = broadcast::channel(REGISTRATION_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            registrations,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or replace the entry for `indexer.id()`.
    ///
    /// Fails with `DuplicateRegistration` when a different instance with a
    /// different version or subscription set replaces an indexer that is
    /// being reindexed. Registration never starts indexing by itself.
    pub fn register(&self, indexer: Arc<dyn Indexer>) -> Result<(), IndexingError> {
        let id = indexer.id().to_string();
        if id.is_empty() {
            return Err(IndexingError::InvalidIndexer(
                "indexer ID must not be empty".to_string(),
            ));
        }

        {
            let mut inner = self.write();
            let mut reindexing = false;

            if let Some(existing) = inner.entries.get(&id) {
                reindexing = existing.reindexing;
                if existing.reindexing
                    && !same_instance(&existing.indexer, &indexer)
                    && capabilities(existing.indexer.as_ref()) != capabilities(indexer.as_ref())
                {
                    return Err(IndexingError::DuplicateRegistration(format!(
                        "{} is being reindexed at version {} and cannot be replaced by version {}",
                        id,
                        existing.indexer.version(),
                        indexer.version()
                    )));
                }
                debug!(indexer = %id, "Replacing registered indexer");
            }

            inner.entries.insert(
                id.clone(),
                Entry {
                    indexer: indexer.clone(),
                    reindexing,
                },
            );
            let matcher = SubscriptionMatcher::from_indexers(
                inner.entries.values().map(|e| e.indexer.as_ref()),
            );
            inner.matcher = Arc::new(matcher);
        }

        info!(
            indexer = %id,
            version = indexer.version(),
            subscriptions = indexer.subscriptions().len(),
            "Registered indexer"
        );

        // No receivers is fine: nobody is scheduling yet.
        let _ = self.registrations.send(id);
        Ok(())
    }

    /// Get an indexer by ID.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Indexer>> {
        self.read().entries.get(id).map(|e| e.indexer.clone())
    }

    /// All registered indexers in ascending ID order.
    pub fn all(&self) -> Vec<Arc<dyn Indexer>> {
        self.read()
            .entries
            .values()
            .map(|e| e.indexer.clone())
            .collect()
    }

    /// All registered IDs in ascending order.
    pub fn ids(&self) -> Vec<String> {
        self.read().entries.keys().cloned().collect()
    }

    /// Number of registered indexers.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    /// Check if no indexer is registered.
    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Snapshot of the current subscription matcher.
    pub fn matcher(&self) -> Arc<SubscriptionMatcher> {
        self.read().matcher.clone()
    }

    /// Receive the ID of every subsequent registration.
    pub fn subscribe_registrations(&self) -> broadcast::Receiver<String> {
        self.registrations.subscribe()
    }

    /// Mark an indexer as being reindexed, or not.
    pub fn set_reindexing(&self, id: &str, reindexing: bool) -> Result<(), IndexingError> {
        let mut inner = self.write();
        match inner.entries.get_mut(id) {
            Some(entry) => {
                entry.reindexing = reindexing;
                Ok(())
            }
            None => Err(IndexingError::NotRegistered(id.to_string())),
        }
    }

    /// Check if an indexer is being reindexed.
    ///
    /// Returns `false` if the indexer is not registered.
    pub fn is_reindexing(&self, id: &str) -> bool {
        self.read()
            .entries
            .get(id)
            .map(|e| e.reindexing)
            .unwrap_or(false)
    }
}

impl Default for IndexerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

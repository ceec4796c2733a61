//! End-to-end test infrastructure for the state indexer.
//!
//! Provides a shared TestHarness wiring a RocksDB checkpoint store, an
//! in-memory state store, the registry, the dispatcher and the coordinator,
//! plus a scripted indexer that records calls and can fail or pause on
//! demand.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use state_indexer::{
    ChangeDispatcher, DispatchStats, DispatcherConfig, Indexer, IndexerRegistry, IndexingError,
    MemoryIndexer, MemoryStateStore, ReindexConfig, ReindexCoordinator, RetryPolicy, StateErrors,
    StateStore, VersionStore,
};
use state_storage::Storage;
use state_types::{StateRecord, Subscription, Version};

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Millisecond-scale backoff so retries do not slow tests down.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_initial_interval(Duration::from_millis(1))
        .with_max_interval(Duration::from_millis(5))
        .with_max_elapsed(Some(Duration::from_secs(2)))
}

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps the temp dir alive for the lifetime of the harness
    pub _temp_dir: Option<tempfile::TempDir>,
    /// RocksDB checkpoint store
    pub storage: Arc<Storage>,
    /// Primary state
    pub store: Arc<MemoryStateStore>,
    /// Indexer catalog
    pub registry: Arc<IndexerRegistry>,
    /// Change fan-out
    pub dispatcher: Arc<ChangeDispatcher>,
    /// Reindex flows
    pub coordinator: Arc<ReindexCoordinator>,
}

impl TestHarness {
    /// Create a harness with default tuning and fast retries.
    pub fn new() -> Self {
        Self::with_config(ReindexConfig::default(), DispatcherConfig::default())
    }

    /// Create a harness in a fresh temp dir with the given tuning.
    pub fn with_config(reindex: ReindexConfig, dispatcher: DispatcherConfig) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let mut harness = Self::open(temp_dir.path(), reindex, dispatcher);
        harness._temp_dir = Some(temp_dir);
        harness
    }

    /// Create a harness over an existing checkpoint directory.
    pub fn open(path: &Path, reindex: ReindexConfig, dispatcher: DispatcherConfig) -> Self {
        init_tracing();

        let storage = Arc::new(Storage::open(path).expect("Failed to open test storage"));
        let store = Arc::new(MemoryStateStore::new());
        let registry = Arc::new(IndexerRegistry::new());
        let dispatcher = Arc::new(ChangeDispatcher::new(
            registry.clone(),
            store.clone() as Arc<dyn StateStore>,
            dispatcher.with_retry(fast_retry()),
        ));
        let coordinator = Arc::new(ReindexCoordinator::new(
            registry.clone(),
            dispatcher.clone(),
            store.clone() as Arc<dyn StateStore>,
            storage.clone() as Arc<dyn VersionStore>,
            reindex.with_retry(fast_retry()),
        ));

        Self {
            _temp_dir: None,
            storage,
            store,
            registry,
            dispatcher,
            coordinator,
        }
    }

    /// Checkpoint of an indexer.
    pub fn checkpoint(&self, indexer_id: &str) -> Option<Version> {
        VersionStore::get(self.storage.as_ref(), indexer_id).expect("Failed to read checkpoint")
    }

    /// Subscribe to the state store and run the dispatcher in the background.
    pub async fn spawn_dispatcher(&self, cancel: CancellationToken) -> JoinHandle<DispatchStats> {
        let feed = self
            .store
            .subscribe()
            .await
            .expect("Failed to subscribe to state store");
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move { dispatcher.run(feed, cancel).await })
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll a condition until it holds, panicking after a few seconds.
pub async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("Timed out waiting for {}", what);
}

/// A call observed by [`ScriptedIndexer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Prepare {
        from: Version,
        to: Version,
        is_first: bool,
    },
    /// `(key, version)` of every record in the batch
    Index(Vec<(String, u64)>),
    Complete {
        from: Version,
        to: Version,
    },
    Abort {
        to: Version,
    },
}

/// Pauses the first bulk `index` call of a reindex.
#[derive(Default)]
pub struct BulkGate {
    entered: Notify,
    release: Notify,
    used: AtomicBool,
}

impl BulkGate {
    /// Wait until the reindex is parked inside bulk indexing.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the parked reindex continue.
    pub fn open(&self) {
        self.release.notify_one();
    }
}

/// Indexer wrapping a [`MemoryIndexer`] that records every call and can
/// be told to fail or pause.
pub struct ScriptedIndexer {
    inner: MemoryIndexer,
    calls: Mutex<Vec<Call>>,
    prepare_failures: AtomicUsize,
    complete_failures: AtomicUsize,
    gate: Option<Arc<BulkGate>>,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl ScriptedIndexer {
    /// Create an indexer declaring `version` over `subscriptions`.
    pub fn new(id: &str, version: Version, subscriptions: Vec<Subscription>) -> Self {
        Self {
            inner: MemoryIndexer::new(id, version, subscriptions),
            calls: Mutex::new(Vec::new()),
            prepare_failures: AtomicUsize::new(0),
            complete_failures: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Fail the next `n` prepare calls.
    pub fn fail_prepare(self, n: usize) -> Self {
        self.prepare_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` complete calls.
    pub fn fail_complete(self, n: usize) -> Self {
        self.complete_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Pause the first bulk `index` call on `gate`.
    pub fn with_gate(mut self, gate: Arc<BulkGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// The wrapped projection.
    pub fn projection(&self) -> &MemoryIndexer {
        &self.inner
    }

    /// Every call so far.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Only the `index` calls so far.
    pub fn index_calls(&self) -> Vec<Vec<(String, u64)>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Index(batch) => Some(batch),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Indexer for ScriptedIndexer {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn version(&self) -> Version {
        self.inner.version()
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.subscriptions()
    }

    async fn prepare_reindex(
        &self,
        from: Version,
        to: Version,
        is_first: bool,
    ) -> Result<(), IndexingError> {
        self.record(Call::Prepare { from, to, is_first });
        if take_one(&self.prepare_failures) {
            return Err(IndexingError::Index("staging area unavailable".into()));
        }
        self.inner.prepare_reindex(from, to, is_first).await
    }

    async fn index(&self, records: &[StateRecord]) -> Result<StateErrors, IndexingError> {
        if let Some(gate) = &self.gate {
            if self.inner.is_staging() && !gate.used.swap(true, Ordering::SeqCst) {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
        }
        self.record(Call::Index(
            records.iter().map(|r| (r.key.clone(), r.version)).collect(),
        ));
        self.inner.index(records).await
    }

    async fn complete_reindex(&self, from: Version, to: Version) -> Result<(), IndexingError> {
        self.record(Call::Complete { from, to });
        if take_one(&self.complete_failures) {
            return Err(IndexingError::Index("promotion failed".into()));
        }
        self.inner.complete_reindex(from, to).await
    }

    async fn abort_reindex(&self, to: Version) -> Result<(), IndexingError> {
        self.record(Call::Abort { to });
        self.inner.abort_reindex(to).await
    }
}

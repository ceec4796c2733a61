//! Change dispatcher.
//!
//! Consumes the state store's change feed and fans every event out to the
//! indexers whose subscriptions match it. Each indexer has its own inbox
//! drained by its own delivery task, so a slow or failing indexer only
//! holds up its own records. Indexers under a reindex lease get their
//! events parked in a bounded replay queue that drains, in arrival order,
//! when the lease is released.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use state_types::{KeyMatcher, Settings, StateChangeEvent, StateId, StateRecord};

use crate::error::IndexingError;
use crate::indexer::{log_state_errors, Indexer};
use crate::registry::IndexerRegistry;
use crate::retry::{retry_transient, RetryPolicy};
use crate::state_store::{ChangeFeed, StateStore};

/// Configuration for the change dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Events held per leased indexer before the lease overflows
    pub replay_queue_capacity: usize,
    /// Records per `index` call when draining a replay queue
    pub replay_batch_size: usize,
    /// Backoff for transient delivery errors
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            replay_queue_capacity: 10_000,
            replay_batch_size: 100,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Settings> for DispatcherConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            replay_queue_capacity: settings.dispatcher.replay_queue_capacity,
            replay_batch_size: settings.reindex.batch_size,
            retry: RetryPolicy::from(&settings.retry),
        }
    }
}

impl DispatcherConfig {
    /// Set the replay queue bound.
    pub fn with_replay_queue_capacity(mut self, capacity: usize) -> Self {
        self.replay_queue_capacity = capacity;
        self
    }

    /// Set the replay batch size.
    pub fn with_replay_batch_size(mut self, size: usize) -> Self {
        self.replay_batch_size = size;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What happened to one event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Indexers whose subscriptions matched
    pub matched: usize,
    /// Indexers that accepted the record
    pub delivered: usize,
    /// Indexers that parked the record in their replay queue
    pub queued: usize,
    /// Indexers whose replay queue had overflowed
    pub dropped: usize,
    /// Indexers whose `index` call failed
    pub failed: usize,
}

impl DispatchOutcome {
    fn record(&mut self, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Delivered => self.delivered += 1,
            DeliveryStatus::Queued => self.queued += 1,
            DeliveryStatus::Dropped => self.dropped += 1,
            DeliveryStatus::Failed => self.failed += 1,
            DeliveryStatus::Skipped => {}
        }
    }
}

/// Running totals across all dispatched events.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Events consumed
    pub events: u64,
    /// Live deliveries that succeeded
    pub delivered: u64,
    /// Records parked for a leased indexer
    pub queued: u64,
    /// Records dropped after a replay queue overflowed
    pub dropped: u64,
    /// Live or replay `index` calls that failed
    pub failed: u64,
    /// Records delivered from replay queues
    pub replayed: u64,
    /// Current records re-read for keys dropped after an overflow
    pub recovered: u64,
    /// Records individually rejected by indexers
    pub record_errors: u64,
}

/// Result of draining one replay queue.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    /// Queued records handed to the indexer
    pub replayed: usize,
    /// Re-read records handed to the indexer for keys dropped after an overflow
    pub recovered: usize,
    /// Dropped keys whose current record could not be read back
    pub unrecovered: usize,
    /// `index` calls that failed
    pub failed_batches: usize,
    /// Records individually rejected
    pub record_errors: usize,
    /// Whether the lease had overflowed
    pub overflowed: bool,
}

/// What a delivery task did with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryStatus {
    Delivered,
    Queued,
    Dropped,
    Failed,
    Skipped,
}

struct Delivery {
    record: StateRecord,
    ack: Option<oneshot::Sender<DeliveryStatus>>,
}

struct Lease {
    overflow: CancellationToken,
}

#[derive(Default)]
struct SlotState {
    lease: Option<Lease>,
    replay: VecDeque<StateRecord>,
    overflowed: bool,
    /// Keys with events dropped since the overflow
    missed: BTreeSet<StateId>,
}

/// Per-indexer bookkeeping. The delivery task holds the state mutex across
/// its `index` call, so taking a lease waits for any in-flight delivery.
struct IndexerSlot {
    state: Arc<tokio::sync::Mutex<SlotState>>,
    inbox: mpsc::UnboundedSender<Delivery>,
}

/// State shared by the dispatcher and its delivery tasks.
struct Shared {
    registry: Arc<IndexerRegistry>,
    state_store: Arc<dyn StateStore>,
    config: DispatcherConfig,
    stats: Mutex<DispatchStats>,
    shutdown: CancellationToken,
}

impl Shared {
    fn update_stats(&self, f: impl FnOnce(&mut DispatchStats)) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut stats);
    }

    /// Deliver one live record, or park it if the indexer is leased.
    async fn deliver(
        &self,
        indexer_id: &str,
        slot: &tokio::sync::Mutex<SlotState>,
        record: StateRecord,
    ) -> DeliveryStatus {
        let mut guard = slot.lock().await;
        let state = &mut *guard;

        if let Some(lease) = &state.lease {
            let status = if state.overflowed {
                state.missed.insert(record.id());
                DeliveryStatus::Dropped
            } else if state.replay.len() >= self.config.replay_queue_capacity {
                state.overflowed = true;
                lease.overflow.cancel();
                warn!(
                    indexer = %indexer_id,
                    capacity = self.config.replay_queue_capacity,
                    state = %record.id(),
                    "Replay queue overflow, dropping events until the reindex ends"
                );
                state.missed.insert(record.id());
                DeliveryStatus::Dropped
            } else {
                debug!(
                    indexer = %indexer_id,
                    state = %record.id(),
                    version = record.version,
                    queued = state.replay.len() + 1,
                    "Queued event for replay"
                );
                state.replay.push_back(record);
                DeliveryStatus::Queued
            };
            self.update_stats(|stats| {
                if status == DeliveryStatus::Queued {
                    stats.queued += 1;
                } else {
                    stats.dropped += 1;
                }
            });
            return status;
        }

        let Some(indexer) = self.registry.get(indexer_id) else {
            debug!(indexer = %indexer_id, "Indexer no longer registered, skipping event");
            return DeliveryStatus::Skipped;
        };

        let indexer_ref: &dyn Indexer = indexer.as_ref();
        let records: &[StateRecord] = std::slice::from_ref(&record);
        match retry_transient(&self.config.retry, "index", &self.shutdown, move || {
            indexer_ref.index(records)
        })
        .await
        {
            Ok(errors) => {
                log_state_errors(indexer_id, &errors);
                let rejected = errors.len() as u64;
                self.update_stats(|stats| {
                    stats.delivered += 1;
                    stats.record_errors += rejected;
                });
                DeliveryStatus::Delivered
            }
            Err(e) => {
                error!(
                    indexer = %indexer_id,
                    state = %record.id(),
                    version = record.version,
                    error = %e,
                    "Failed to index event"
                );
                self.update_stats(|stats| stats.failed += 1);
                DeliveryStatus::Failed
            }
        }
    }

    /// Hand records to an indexer in order, in replay-sized batches.
    ///
    /// Returns how many records were accepted.
    async fn deliver_batches(
        &self,
        indexer_id: &str,
        indexer: &dyn Indexer,
        records: &[StateRecord],
        summary: &mut ReplaySummary,
    ) -> usize {
        let mut accepted = 0;
        for batch in records.chunks(self.config.replay_batch_size.max(1)) {
            match retry_transient(&self.config.retry, "replay", &self.shutdown, move || {
                indexer.index(batch)
            })
            .await
            {
                Ok(errors) => {
                    log_state_errors(indexer_id, &errors);
                    accepted += batch.len();
                    summary.record_errors += errors.len();
                }
                Err(e) => {
                    error!(
                        indexer = %indexer_id,
                        records = batch.len(),
                        error = %e,
                        "Failed to replay events"
                    );
                    summary.failed_batches += 1;
                }
            }
        }
        accepted
    }

    /// Read the current record of every dropped key, tombstones included.
    ///
    /// Keys that no longer exist at all are skipped.
    async fn reread(
        &self,
        indexer_id: &str,
        missed: &BTreeSet<StateId>,
        summary: &mut ReplaySummary,
    ) -> Vec<StateRecord> {
        let store: &dyn StateStore = self.state_store.as_ref();
        let mut records = Vec::with_capacity(missed.len());

        for id in missed {
            let matcher = KeyMatcher::exact(id.key.as_str());
            let matcher_ref = &matcher;
            let state_type = id.state_type.as_str();
            match retry_transient(&self.config.retry, "list_snapshot", &self.shutdown, move || {
                store.list_snapshot(state_type, Some(matcher_ref), None, 1)
            })
            .await
            {
                Ok(page) => records.extend(page.into_iter().filter(|r| r.key == id.key)),
                Err(e) => {
                    error!(
                        indexer = %indexer_id,
                        state = %id,
                        error = %e,
                        "Failed to re-read dropped state"
                    );
                    summary.unrecovered += 1;
                }
            }
        }
        records
    }
}

/// Deliver one indexer's inbox in arrival order until the dispatcher drops
/// the sending side.
async fn drain_inbox(
    shared: Arc<Shared>,
    indexer_id: String,
    slot: Arc<tokio::sync::Mutex<SlotState>>,
    mut inbox: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = inbox.recv().await {
        let status = shared.deliver(&indexer_id, &slot, delivery.record).await;
        if let Some(ack) = delivery.ack {
            // The caller may have stopped waiting
            let _ = ack.send(status);
        }
    }
    debug!(indexer = %indexer_id, "Delivery task stopped");
}

/// Fans state changes out to indexers.
pub struct ChangeDispatcher {
    shared: Arc<Shared>,
    slots: Mutex<HashMap<String, Arc<IndexerSlot>>>,
}

impl ChangeDispatcher {
    /// Create a dispatcher over a registry.
    ///
    /// `state_store` is read back when a leased indexer's replay queue
    /// overflowed, to recover the keys whose events were dropped.
    pub fn new(
        registry: Arc<IndexerRegistry>,
        state_store: Arc<dyn StateStore>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                state_store,
                config,
                stats: Mutex::new(DispatchStats::default()),
                shutdown: CancellationToken::new(),
            }),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<IndexerSlot>>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get the slot of an indexer, starting its delivery task on first use.
    fn slot(&self, indexer_id: &str) -> Arc<IndexerSlot> {
        let mut slots = self.slots();
        if let Some(slot) = slots.get(indexer_id) {
            return slot.clone();
        }

        let (inbox, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(tokio::sync::Mutex::new(SlotState::default()));
        tokio::spawn(drain_inbox(
            self.shared.clone(),
            indexer_id.to_string(),
            state.clone(),
            receiver,
        ));
        debug!(indexer = %indexer_id, "Started delivery task");

        let slot = Arc::new(IndexerSlot { state, inbox });
        slots.insert(indexer_id.to_string(), slot.clone());
        slot
    }

    fn existing_slot(&self, indexer_id: &str) -> Option<Arc<IndexerSlot>> {
        self.slots().get(indexer_id).cloned()
    }

    /// Snapshot of the running totals.
    pub fn stats(&self) -> DispatchStats {
        self.shared
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Stop transient-error retries of deliveries and replays.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Queue one event on the inbox of every matching indexer.
    ///
    /// With `acknowledge` set, returns one receiver per matched indexer that
    /// resolves once that indexer's delivery task handled the record.
    fn route(
        &self,
        event: &StateChangeEvent,
        acknowledge: bool,
    ) -> (usize, Vec<oneshot::Receiver<DeliveryStatus>>) {
        let matched = self.shared.registry.matcher().match_event(event);
        self.shared.update_stats(|stats| stats.events += 1);

        if matched.is_empty() {
            debug!(state = %event.id(), version = event.version, "No subscribers for event");
        }

        let record = event.to_record();
        let mut acks = Vec::new();
        for indexer_id in &matched {
            let ack = if acknowledge {
                let (tx, rx) = oneshot::channel();
                acks.push(rx);
                Some(tx)
            } else {
                None
            };
            let delivery = Delivery {
                record: record.clone(),
                ack,
            };
            if self.slot(indexer_id).inbox.send(delivery).is_err() {
                error!(
                    indexer = %indexer_id,
                    state = %event.id(),
                    "Delivery task stopped, dropping event"
                );
            }
        }
        (matched.len(), acks)
    }

    /// Dispatch one event to every matching indexer and wait for each of
    /// them to handle it.
    ///
    /// A failing indexer is logged and counted; it never stops delivery to
    /// the others.
    pub async fn dispatch(&self, event: &StateChangeEvent) -> DispatchOutcome {
        let (matched, acks) = self.route(event, true);
        let mut outcome = DispatchOutcome {
            matched,
            ..Default::default()
        };
        for ack in acks {
            outcome.record(ack.await.unwrap_or(DeliveryStatus::Failed));
        }
        outcome
    }

    /// Take the reindex lease for an indexer.
    ///
    /// Waits for any in-flight live delivery to that indexer. From now on
    /// its events are queued; if the queue overflows `overflow` is
    /// cancelled. Fails with `ReindexInProgress` if a lease is already held.
    pub async fn acquire(
        &self,
        indexer_id: &str,
        overflow: CancellationToken,
    ) -> Result<(), IndexingError> {
        let slot = self.slot(indexer_id);
        let mut state = slot.state.lock().await;

        if state.lease.is_some() {
            return Err(IndexingError::ReindexInProgress(indexer_id.to_string()));
        }

        state.replay.clear();
        state.missed.clear();
        state.overflowed = false;
        state.lease = Some(Lease { overflow });

        info!(indexer = %indexer_id, "Acquired reindex lease");
        Ok(())
    }

    /// Release the reindex lease, draining the replay queue first.
    ///
    /// Queued records are delivered in arrival order while the slot is
    /// still held, so no newer live event overtakes them. If the queue
    /// overflowed, the current record of every key dropped since then is
    /// read back from the state store and delivered after the queue.
    /// Other indexers keep receiving events meanwhile.
    pub async fn release(&self, indexer_id: &str) -> ReplaySummary {
        let Some(slot) = self.existing_slot(indexer_id) else {
            debug!(indexer = %indexer_id, "Release without lease");
            return ReplaySummary::default();
        };
        let mut guard = slot.state.lock().await;
        let state = &mut *guard;

        let mut summary = ReplaySummary {
            overflowed: state.overflowed,
            ..Default::default()
        };

        if state.lease.is_none() {
            debug!(indexer = %indexer_id, "Release without lease");
            return summary;
        }

        let queued: Vec<StateRecord> = state.replay.drain(..).collect();
        let missed = std::mem::take(&mut state.missed);
        let shared = self.shared.as_ref();

        match shared.registry.get(indexer_id) {
            Some(indexer) => {
                let replayed = shared
                    .deliver_batches(indexer_id, indexer.as_ref(), &queued, &mut summary)
                    .await;
                summary.replayed = replayed;
                if !missed.is_empty() {
                    let current = shared.reread(indexer_id, &missed, &mut summary).await;
                    let recovered = shared
                        .deliver_batches(indexer_id, indexer.as_ref(), &current, &mut summary)
                        .await;
                    summary.recovered = recovered;
                }
            }
            None => {
                warn!(
                    indexer = %indexer_id,
                    dropped = queued.len() + missed.len(),
                    "Indexer no longer registered, dropping replay queue"
                );
            }
        }

        state.lease = None;
        state.overflowed = false;

        shared.update_stats(|stats| {
            stats.replayed += summary.replayed as u64;
            stats.recovered += summary.recovered as u64;
            stats.failed += summary.failed_batches as u64;
            stats.record_errors += summary.record_errors as u64;
        });

        info!(
            indexer = %indexer_id,
            replayed = summary.replayed,
            recovered = summary.recovered,
            unrecovered = summary.unrecovered,
            failed_batches = summary.failed_batches,
            overflowed = summary.overflowed,
            "Released reindex lease"
        );
        summary
    }

    /// Check if an indexer is leased.
    pub async fn is_locked(&self, indexer_id: &str) -> bool {
        match self.existing_slot(indexer_id) {
            Some(slot) => slot.state.lock().await.lease.is_some(),
            None => false,
        }
    }

    /// Check if the lease of an indexer overflowed.
    pub async fn is_overflowed(&self, indexer_id: &str) -> bool {
        match self.existing_slot(indexer_id) {
            Some(slot) => slot.state.lock().await.overflowed,
            None => false,
        }
    }

    /// Number of records parked for an indexer.
    pub async fn queued(&self, indexer_id: &str) -> usize {
        match self.existing_slot(indexer_id) {
            Some(slot) => slot.state.lock().await.replay.len(),
            None => 0,
        }
    }

    /// Consume a change feed until it closes or `cancel` fires.
    ///
    /// Events are handed to the per-indexer inboxes without waiting for
    /// delivery, so deliveries may still be in flight when this returns.
    /// Returns the running totals at exit.
    pub async fn run(&self, mut feed: ChangeFeed, cancel: CancellationToken) -> DispatchStats {
        info!("Change dispatcher started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Change dispatcher cancelled");
                    break;
                }
                event = feed.recv() => match event {
                    Some(event) => {
                        self.route(&event, false);
                    }
                    None => {
                        info!("Change feed closed");
                        break;
                    }
                },
            }
        }

        let stats = self.stats();
        info!(
            events = stats.events,
            delivered = stats.delivered,
            queued = stats.queued,
            dropped = stats.dropped,
            failed = stats.failed,
            replayed = stats.replayed,
            recovered = stats.recovered,
            "Change dispatcher stopped"
        );
        stats
    }
}

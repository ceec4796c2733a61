//! Reindex coordination.
//!
//! Drives an indexer from its checkpointed version to its declared version:
//! `Pending → Preparing → BulkIndexing → Completing → Done`, or `Failed`
//! from any non-terminal state. The checkpoint moves only after the indexer
//! promoted the new generation, and live events for the indexer are held in
//! the dispatcher's replay queue for the whole flow.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use backoff::backoff::Backoff;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use state_types::{JobStatus, ReindexJob, Settings, StateRecord, Version};

use crate::dispatcher::ChangeDispatcher;
use crate::error::IndexingError;
use crate::indexer::{log_state_errors, Indexer};
use crate::registry::IndexerRegistry;
use crate::retry::{retry_transient, RetryPolicy};
use crate::state_store::StateStore;
use crate::version_store::VersionStore;

/// Configuration for reindex flows.
#[derive(Debug, Clone)]
pub struct ReindexConfig {
    /// Records requested per snapshot page
    pub snapshot_page_size: usize,
    /// Records per `index` call during bulk indexing
    pub batch_size: usize,
    /// Attempts per indexer before giving up
    pub max_attempts: u32,
    /// Terminal jobs kept in history
    pub history_limit: usize,
    /// Backoff for transient errors and between attempts
    pub retry: RetryPolicy,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            snapshot_page_size: 500,
            batch_size: 100,
            max_attempts: 5,
            history_limit: 64,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Settings> for ReindexConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            snapshot_page_size: settings.reindex.snapshot_page_size,
            batch_size: settings.reindex.batch_size,
            max_attempts: settings.reindex.max_attempts,
            history_limit: settings.reindex.history_limit,
            retry: RetryPolicy::from(&settings.retry),
        }
    }
}

impl ReindexConfig {
    /// Set the snapshot page size.
    pub fn with_snapshot_page_size(mut self, size: usize) -> Self {
        self.snapshot_page_size = size;
        self
    }

    /// Set the bulk batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the attempt limit.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the history bound.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// A version mismatch that calls for a reindex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedReindex {
    /// Indexer to rebuild
    pub indexer_id: String,
    /// Checkpointed version, 0 when none exists
    pub from_version: Version,
    /// Declared version
    pub to_version: Version,
    /// Whether no checkpoint exists yet
    pub is_first: bool,
}

/// Outcome of a batch of reindex flows.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorSummary {
    /// Indexers that reached their declared version
    pub done: Vec<String>,
    /// Indexers that needed no reindex
    pub up_to_date: Vec<String>,
    /// Indexers that gave up, with the last error
    pub failed: Vec<(String, String)>,
}

impl CoordinatorSummary {
    fn record(&mut self, indexer_id: String, result: Result<Option<ReindexJob>, IndexingError>) {
        match result {
            Ok(Some(_)) => self.done.push(indexer_id),
            Ok(None) => self.up_to_date.push(indexer_id),
            Err(e) => self.failed.push((indexer_id, e.to_string())),
        }
    }

    fn sort(&mut self) {
        self.done.sort();
        self.up_to_date.sort();
        self.failed.sort();
    }
}

type FlowResult = (String, Result<Option<ReindexJob>, IndexingError>);

/// Owns reindex jobs and runs one flow per indexer.
pub struct ReindexCoordinator {
    registry: Arc<IndexerRegistry>,
    dispatcher: Arc<ChangeDispatcher>,
    state_store: Arc<dyn StateStore>,
    versions: Arc<dyn VersionStore>,
    config: ReindexConfig,
    jobs: Mutex<HashMap<String, ReindexJob>>,
    history: Mutex<VecDeque<ReindexJob>>,
}

impl ReindexCoordinator {
    /// Create a coordinator.
    pub fn new(
        registry: Arc<IndexerRegistry>,
        dispatcher: Arc<ChangeDispatcher>,
        state_store: Arc<dyn StateStore>,
        versions: Arc<dyn VersionStore>,
        config: ReindexConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            state_store,
            versions,
            config,
            jobs: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &ReindexConfig {
        &self.config
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, ReindexJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn history_lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ReindexJob>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Compare an indexer's declared version with its checkpoint.
    ///
    /// A declared version below the checkpoint is logged and ignored, since
    /// checkpoints never move backwards.
    pub fn plan(&self, indexer: &dyn Indexer) -> Result<Option<PlannedReindex>, IndexingError> {
        let declared = indexer.version();
        let planned = |from_version, is_first| PlannedReindex {
            indexer_id: indexer.id().to_string(),
            from_version,
            to_version: declared,
            is_first,
        };

        match self.versions.get(indexer.id())? {
            None => Ok(Some(planned(0, true))),
            Some(stored) if declared > stored => Ok(Some(planned(stored, false))),
            Some(stored) if declared < stored => {
                warn!(
                    indexer = %indexer.id(),
                    declared,
                    stored,
                    "Declared version is below the checkpoint, not reindexing"
                );
                Ok(None)
            }
            Some(_) => Ok(None),
        }
    }

    /// Every registered indexer whose declared version needs a reindex.
    pub fn pending_reindexes(&self) -> Result<Vec<PlannedReindex>, IndexingError> {
        let mut pending = Vec::new();
        for indexer in self.registry.all() {
            if let Some(plan) = self.plan(indexer.as_ref())? {
                pending.push(plan);
            }
        }
        Ok(pending)
    }

    /// The non-terminal job of an indexer, if any.
    pub fn active_job(&self, indexer_id: &str) -> Option<ReindexJob> {
        self.jobs().get(indexer_id).cloned()
    }

    /// Every non-terminal job, in indexer ID order.
    pub fn active_jobs(&self) -> Vec<ReindexJob> {
        let mut jobs: Vec<_> = self.jobs().values().cloned().collect();
        jobs.sort_by(|a, b| a.indexer_id.cmp(&b.indexer_id));
        jobs
    }

    /// Recently finished jobs, oldest first.
    pub fn history(&self) -> Vec<ReindexJob> {
        self.history_lock().iter().cloned().collect()
    }

    fn begin_job(&self, job: ReindexJob) -> Result<(), IndexingError> {
        let mut jobs = self.jobs();
        if jobs.contains_key(&job.indexer_id) {
            return Err(IndexingError::ReindexInProgress(job.indexer_id));
        }
        info!(
            indexer = %job.indexer_id,
            from_version = job.from_version,
            to_version = job.to_version,
            attempt = job.attempt,
            "Created reindex job"
        );
        jobs.insert(job.indexer_id.clone(), job);
        Ok(())
    }

    fn advance(&self, indexer_id: &str, next: JobStatus) -> Result<(), IndexingError> {
        let mut jobs = self.jobs();
        let job = jobs
            .get_mut(indexer_id)
            .ok_or_else(|| IndexingError::JobState(format!("no active job for {}", indexer_id)))?;
        job.advance(next)
            .map_err(|e| IndexingError::JobState(e.to_string()))?;
        info!(
            indexer = %indexer_id,
            from_version = job.from_version,
            to_version = job.to_version,
            status = %next,
            "Reindex job transition"
        );
        Ok(())
    }

    fn record_batch(&self, indexer_id: &str, batch: &[StateRecord], record_errors: usize) {
        if let Some(job) = self.jobs().get_mut(indexer_id) {
            job.record_batch(
                batch.len() as u64,
                record_errors as u64,
                batch.last().map(StateRecord::id),
            );
        }
    }

    fn finish_job(&self, indexer_id: &str, error: Option<&IndexingError>) -> Option<ReindexJob> {
        let mut job = self.jobs().remove(indexer_id)?;
        if let Some(e) = error {
            job.fail(e.to_string());
            error!(
                indexer = %indexer_id,
                from_version = job.from_version,
                to_version = job.to_version,
                attempt = job.attempt,
                elapsed_ms = job.elapsed_ms(),
                error = %e,
                "Reindex job failed"
            );
        } else {
            info!(
                indexer = %indexer_id,
                to_version = job.to_version,
                records = job.progress.records_indexed,
                batches = job.progress.batches,
                elapsed_ms = job.elapsed_ms(),
                "Reindex job done"
            );
        }

        let mut history = self.history_lock();
        history.push_back(job.clone());
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
        Some(job)
    }

    fn check_interrupt(
        &self,
        indexer_id: &str,
        cancel: &CancellationToken,
        overflow: &CancellationToken,
    ) -> Result<(), IndexingError> {
        if cancel.is_cancelled() {
            return Err(IndexingError::Cancelled(format!(
                "reindex of {} cancelled",
                indexer_id
            )));
        }
        if overflow.is_cancelled() {
            return Err(IndexingError::ReplayQueueOverflow {
                indexer_id: indexer_id.to_string(),
                capacity: self.dispatcher.config().replay_queue_capacity,
            });
        }
        Ok(())
    }

    /// Run one reindex attempt for an indexer.
    ///
    /// Returns `None` when the indexer is already at its declared version.
    /// A failed attempt is archived in `history` and its error returned.
    pub async fn reindex(
        &self,
        indexer_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ReindexJob>, IndexingError> {
        let indexer = self
            .registry
            .get(indexer_id)
            .ok_or_else(|| IndexingError::NotRegistered(indexer_id.to_string()))?;
        let Some(plan) = self.plan(indexer.as_ref())? else {
            debug!(indexer = %indexer_id, "Indexer is up to date");
            return Ok(None);
        };
        self.attempt(indexer, plan, 1, cancel).await.map(Some)
    }

    /// Reindex with retries until done, a non-retryable failure, the
    /// attempt limit, or cancellation.
    pub async fn reindex_with_retry(
        &self,
        indexer_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ReindexJob>, IndexingError> {
        let mut backoff = self.config.retry.clone().with_max_elapsed(None).backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            // Re-read each time: the indexer may have been re-registered.
            let indexer = self
                .registry
                .get(indexer_id)
                .ok_or_else(|| IndexingError::NotRegistered(indexer_id.to_string()))?;
            let Some(plan) = self.plan(indexer.as_ref())? else {
                return Ok(None);
            };

            match self.attempt(indexer, plan, attempt, cancel).await {
                Ok(job) => return Ok(Some(job)),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.config.max_attempts => {
                    error!(
                        indexer = %indexer_id,
                        attempts = attempt,
                        error = %e,
                        "Reindex attempts exhausted"
                    );
                    return Err(e);
                }
                Err(e) => match backoff.next_backoff() {
                    Some(duration) => {
                        warn!(
                            indexer = %indexer_id,
                            attempt,
                            error = %e,
                            retry_in_ms = duration.as_millis() as u64,
                            "Reindex attempt failed, retrying"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(IndexingError::Cancelled(format!(
                                    "reindex of {} cancelled",
                                    indexer_id
                                )));
                            }
                            _ = tokio::time::sleep(duration) => {}
                        }
                    }
                    None => {
                        error!(indexer = %indexer_id, error = %e, "Backoff exhausted");
                        return Err(e);
                    }
                },
            }
        }
    }

    async fn attempt(
        &self,
        indexer: Arc<dyn Indexer>,
        plan: PlannedReindex,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<ReindexJob, IndexingError> {
        let indexer_id = plan.indexer_id.clone();
        self.begin_job(
            ReindexJob::new(&indexer_id, plan.from_version, plan.to_version).with_attempt(attempt),
        )?;

        if let Err(e) = self.registry.set_reindexing(&indexer_id, true) {
            self.finish_job(&indexer_id, Some(&e));
            return Err(e);
        }

        let overflow = CancellationToken::new();
        let mut leased = false;
        let mut prepared = false;

        let result = self
            .drive(
                indexer.as_ref(),
                &plan,
                cancel,
                &overflow,
                &mut leased,
                &mut prepared,
            )
            .await;

        if let Err(e) = &result {
            if prepared {
                if let Err(abort_err) = indexer.abort_reindex(plan.to_version).await {
                    warn!(
                        indexer = %indexer_id,
                        to_version = plan.to_version,
                        error = %abort_err,
                        cause = %e,
                        "Failed to abort staged generation"
                    );
                }
            }
        }

        if leased {
            self.dispatcher.release(&indexer_id).await;
        }

        if let Err(e) = self.registry.set_reindexing(&indexer_id, false) {
            warn!(indexer = %indexer_id, error = %e, "Failed to clear reindexing flag");
        }

        let job = self.finish_job(&indexer_id, result.as_ref().err());
        result?;
        job.ok_or_else(|| IndexingError::JobState(format!("job for {} vanished", indexer_id)))
    }

    async fn drive(
        &self,
        indexer: &dyn Indexer,
        plan: &PlannedReindex,
        cancel: &CancellationToken,
        overflow: &CancellationToken,
        leased: &mut bool,
        prepared: &mut bool,
    ) -> Result<(), IndexingError> {
        let indexer_id = plan.indexer_id.as_str();
        let (from, to, is_first) = (plan.from_version, plan.to_version, plan.is_first);

        self.check_interrupt(indexer_id, cancel, overflow)?;

        // Lease before prepare: no live delivery once the job leaves Pending.
        self.dispatcher.acquire(indexer_id, overflow.clone()).await?;
        *leased = true;

        self.advance(indexer_id, JobStatus::Preparing)?;
        *prepared = true;
        retry_transient(&self.config.retry, "prepare_reindex", cancel, move || {
            indexer.prepare_reindex(from, to, is_first)
        })
        .await
        .map_err(|e| match e {
            IndexingError::Cancelled(_) | IndexingError::PrepareFailed { .. } => e,
            other => IndexingError::PrepareFailed {
                indexer_id: indexer_id.to_string(),
                reason: other.to_string(),
            },
        })?;

        self.check_interrupt(indexer_id, cancel, overflow)?;
        self.advance(indexer_id, JobStatus::BulkIndexing)?;
        self.bulk_index(indexer, cancel, overflow).await?;

        self.check_interrupt(indexer_id, cancel, overflow)?;
        self.advance(indexer_id, JobStatus::Completing)?;
        retry_transient(&self.config.retry, "complete_reindex", cancel, move || {
            indexer.complete_reindex(from, to)
        })
        .await
        .map_err(|e| match e {
            IndexingError::Cancelled(_) | IndexingError::CompleteFailed { .. } => e,
            other => IndexingError::CompleteFailed {
                indexer_id: indexer_id.to_string(),
                reason: other.to_string(),
            },
        })?;

        // The promoted generation only catches up on keys dropped while
        // completing when the lease is released; keep the checkpoint so the
        // next attempt rebuilds.
        if overflow.is_cancelled() {
            return Err(IndexingError::ReplayQueueOverflow {
                indexer_id: indexer_id.to_string(),
                capacity: self.dispatcher.config().replay_queue_capacity,
            });
        }

        self.versions.set(indexer_id, to)?;
        self.advance(indexer_id, JobStatus::Done)?;
        Ok(())
    }

    /// Stream the snapshot of every subscription into the indexer.
    ///
    /// Subscriptions are visited in `(state_type, key_pattern)` order and
    /// each is paged in ascending key order.
    async fn bulk_index(
        &self,
        indexer: &dyn Indexer,
        cancel: &CancellationToken,
        overflow: &CancellationToken,
    ) -> Result<(), IndexingError> {
        let indexer_id = indexer.id();
        let page_size = self.config.snapshot_page_size.max(1);
        let batch_size = self.config.batch_size.max(1);
        let store: &dyn StateStore = self.state_store.as_ref();

        let mut subscriptions = indexer.subscriptions();
        subscriptions.sort();
        subscriptions.dedup();

        if subscriptions.is_empty() {
            debug!(indexer = %indexer_id, "No subscriptions, empty snapshot");
        }

        for subscription in &subscriptions {
            let state_type = subscription.state_type.as_str();
            let pattern = subscription.key_pattern.as_ref();
            let mut after_key: Option<String> = None;

            loop {
                self.check_interrupt(indexer_id, cancel, overflow)?;

                let after = after_key.as_deref();
                let page = retry_transient(&self.config.retry, "list_snapshot", cancel, move || {
                    store.list_snapshot(state_type, pattern, after, page_size)
                })
                .await?;

                if page.is_empty() {
                    break;
                }

                for batch in page.chunks(batch_size) {
                    self.check_interrupt(indexer_id, cancel, overflow)?;

                    let errors = retry_transient(&self.config.retry, "index", cancel, move || {
                        indexer.index(batch)
                    })
                    .await?;
                    log_state_errors(indexer_id, &errors);
                    self.record_batch(indexer_id, batch, errors.len());
                }

                debug!(
                    indexer = %indexer_id,
                    state_type,
                    records = page.len(),
                    "Indexed snapshot page"
                );

                let full_page = page.len() >= page_size;
                after_key = page.last().map(|r| r.key.clone());
                if !full_page {
                    break;
                }
            }
        }

        Ok(())
    }

    fn spawn_flow(
        self: &Arc<Self>,
        flows: &mut JoinSet<FlowResult>,
        indexer_id: String,
        cancel: &CancellationToken,
    ) {
        let this = Arc::clone(self);
        let cancel = cancel.clone();
        flows.spawn(async move {
            let result = this.reindex_with_retry(&indexer_id, &cancel).await;
            (indexer_id, result)
        });
    }

    /// Reindex every registered indexer that needs it, concurrently, and
    /// wait for all flows.
    pub async fn run_pending(self: Arc<Self>, cancel: CancellationToken) -> CoordinatorSummary {
        let mut flows = JoinSet::new();
        let mut summary = CoordinatorSummary::default();

        for id in self.registry.ids() {
            self.spawn_flow(&mut flows, id, &cancel);
        }

        while let Some(joined) = flows.join_next().await {
            match joined {
                Ok((id, result)) => summary.record(id, result),
                Err(e) => error!(error = %e, "Reindex flow panicked"),
            }
        }

        summary.sort();
        summary
    }

    /// Reindex pending indexers and keep scheduling flows for new
    /// registrations until cancelled.
    ///
    /// On cancellation running flows stop at their next step boundary and
    /// are awaited before returning.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> CoordinatorSummary {
        let mut registrations = self.registry.subscribe_registrations();
        let mut flows: JoinSet<FlowResult> = JoinSet::new();
        let mut scheduled: HashSet<String> = HashSet::new();
        let mut rescan: HashSet<String> = HashSet::new();
        let mut summary = CoordinatorSummary::default();

        info!(indexers = self.registry.len(), "Reindex coordinator started");

        for id in self.registry.ids() {
            scheduled.insert(id.clone());
            self.spawn_flow(&mut flows, id, &cancel);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = registrations.recv() => match message {
                    Ok(id) => {
                        if scheduled.insert(id.clone()) {
                            self.spawn_flow(&mut flows, id, &cancel);
                        } else {
                            debug!(indexer = %id, "Flow already running, rechecking when it ends");
                            rescan.insert(id);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed registration notices, rescanning registry");
                        for id in self.registry.ids() {
                            if scheduled.insert(id.clone()) {
                                self.spawn_flow(&mut flows, id, &cancel);
                            } else {
                                rescan.insert(id);
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(joined) = flows.join_next(), if !flows.is_empty() => match joined {
                    Ok((id, result)) => {
                        scheduled.remove(&id);
                        summary.record(id.clone(), result);
                        if rescan.remove(&id) {
                            scheduled.insert(id.clone());
                            self.spawn_flow(&mut flows, id, &cancel);
                        }
                    }
                    Err(e) => error!(error = %e, "Reindex flow panicked"),
                },
            }
        }

        while let Some(joined) = flows.join_next().await {
            match joined {
                Ok((id, result)) => summary.record(id, result),
                Err(e) => error!(error = %e, "Reindex flow panicked"),
            }
        }

        summary.sort();
        info!(
            done = summary.done.len(),
            up_to_date = summary.up_to_date.len(),
            failed = summary.failed.len(),
            "Reindex coordinator stopped"
        );
        summary
    }
}

//! Reindex job records.
//!
//! A job walks `Pending → Preparing → BulkIndexing → Completing → Done`,
//! with `Failed` reachable from every non-terminal state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypesError;
use crate::state::StateId;
use crate::version::Version;

/// Lifecycle state of a reindex job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, nothing called yet
    Pending,
    /// Waiting on the indexer to stage a new generation
    Preparing,
    /// Streaming the snapshot into the new generation
    BulkIndexing,
    /// Waiting on the indexer to promote the new generation
    Completing,
    /// Promoted and checkpointed
    Done,
    /// Gave up; checkpoint untouched
    Failed,
}

impl JobStatus {
    /// Whether the job can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Check whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Preparing)
            | (Preparing, BulkIndexing)
            | (BulkIndexing, Completing)
            | (Completing, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Preparing => "preparing",
            JobStatus::BulkIndexing => "bulk_indexing",
            JobStatus::Completing => "completing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Bulk-indexing progress of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Records handed to the indexer so far
    pub records_indexed: u64,
    /// Batches handed to the indexer so far
    pub batches: u64,
    /// Records the indexer reported as individually failed
    pub record_errors: u64,
    /// Last record delivered, in snapshot order
    pub cursor: Option<StateId>,
}

/// One attempt at moving an indexer from `from_version` to `to_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexJob {
    /// Indexer being rebuilt
    pub indexer_id: String,
    /// Checkpointed version at job creation (0 on first run)
    pub from_version: Version,
    /// Declared version the job is building
    pub to_version: Version,
    /// Current state
    pub status: JobStatus,
    /// When the job was created
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    /// When the job reached a terminal state
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub finished_at: Option<DateTime<Utc>>,
    /// 1-based attempt number
    pub attempt: u32,
    /// Originating error of a failed job
    #[serde(default)]
    pub error: Option<String>,
    /// Bulk-indexing progress
    #[serde(default)]
    pub progress: JobProgress,
}

impl ReindexJob {
    /// Create a pending job.
    pub fn new(indexer_id: impl Into<String>, from_version: Version, to_version: Version) -> Self {
        Self {
            indexer_id: indexer_id.into(),
            from_version,
            to_version,
            status: JobStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            attempt: 1,
            error: None,
            progress: JobProgress::default(),
        }
    }

    /// Set the attempt number.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Whether this is the first reindex the indexer ever ran.
    pub fn is_first(&self) -> bool {
        self.from_version == 0
    }

    /// Whether the job can no longer change.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to the next state along the happy path.
    pub fn advance(&mut self, next: JobStatus) -> Result<(), TypesError> {
        if next == JobStatus::Failed || !self.status.can_transition_to(next) {
            return Err(TypesError::InvalidInput(format!(
                "illegal job transition {} -> {} for indexer {}",
                self.status, next, self.indexer_id
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Mark the job failed, keeping the originating error.
    ///
    /// A job already in a terminal state is left untouched.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    /// Record a delivered batch.
    pub fn record_batch(&mut self, records: u64, record_errors: u64, cursor: Option<StateId>) {
        self.progress.records_indexed += records;
        self.progress.record_errors += record_errors;
        self.progress.batches += 1;
        if cursor.is_some() {
            self.progress.cursor = cursor;
        }
    }

    /// Wall-clock duration of the job so far, in milliseconds.
    pub fn elapsed_ms(&self) -> i64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds()
    }
}

//! Error types for the indexing core.

use state_storage::StorageError;
use thiserror::Error;

/// Errors that can occur while registering, dispatching to, or reindexing indexers
#[derive(Error, Debug)]
pub enum IndexingError {
    /// I/O hiccup from the state store or an indexer; safe to retry in place
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Generic index operation error
    #[error("Index error: {0}")]
    Index(String),

    /// The indexer could not stage a new generation
    #[error("Prepare failed for {indexer_id}: {reason}")]
    PrepareFailed { indexer_id: String, reason: String },

    /// The indexer could not promote its new generation
    #[error("Complete failed for {indexer_id}: {reason}")]
    CompleteFailed { indexer_id: String, reason: String },

    /// A conflicting indexer replaced one that is mid-reindex
    #[error("Duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// The indexer declares an unusable identity
    #[error("Invalid indexer: {0}")]
    InvalidIndexer(String),

    /// No indexer with this ID is registered
    #[error("Indexer not registered: {0}")]
    NotRegistered(String),

    /// A non-terminal job already exists for the indexer
    #[error("Reindex already in progress for {0}")]
    ReindexInProgress(String),

    /// Live events outgrew the replay queue during a reindex
    #[error("Replay queue overflow for {indexer_id} (capacity {capacity})")]
    ReplayQueueOverflow { indexer_id: String, capacity: usize },

    /// The flow was cancelled between two steps
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Checkpoint would move backwards
    #[error("Version regression for {indexer_id}: stored {stored}, requested {requested}")]
    VersionRegression {
        indexer_id: String,
        stored: u64,
        requested: u64,
    },

    /// Illegal job state transition
    #[error("Job state error: {0}")]
    JobState(String),

    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl IndexingError {
    /// Whether the failing call may simply be repeated after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexingError::TransientIo(_))
    }

    /// Whether a failed reindex job should be attempted again.
    ///
    /// Configuration and programming errors, cancellation and checkpoint
    /// regressions are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            IndexingError::DuplicateRegistration(_)
                | IndexingError::InvalidIndexer(_)
                | IndexingError::NotRegistered(_)
                | IndexingError::ReindexInProgress(_)
                | IndexingError::Cancelled(_)
                | IndexingError::VersionRegression { .. }
                | IndexingError::JobState(_)
        )
    }

    /// Whether the error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IndexingError::Cancelled(_))
    }
}

impl From<StorageError> for IndexingError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionRegression {
                indexer_id,
                stored,
                requested,
            } => IndexingError::VersionRegression {
                indexer_id,
                stored,
                requested,
            },
            other => IndexingError::Storage(other),
        }
    }
}

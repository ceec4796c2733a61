//! Indexer registry and reindex coordination.
//!
//! Keeps pluggable secondary indexers consistent with a continuously
//! changing primary state store: live changes are fanned out to the
//! indexers that subscribed to them, and an indexer whose declared version
//! moves ahead of its checkpoint is rebuilt through a two-phase reindex
//! without losing updates.
//!
//! ## Key Components
//!
//! - [`Indexer`]: Plugin trait implemented by every projection
//! - [`IndexerRegistry`]: Catalog of registered indexers
//! - [`SubscriptionMatcher`]: Maps a change to the indexers interested in it
//! - [`ChangeDispatcher`]: Delivers the change feed, parking events for
//!   indexers under reindex
//! - [`ReindexCoordinator`]: Runs the prepare, bulk-index, complete flow
//! - [`VersionStore`]: Durable per-indexer checkpoints
//! - [`StateStore`]: The primary store as consumed here
//!
//! ## Example
//!
//! ```ignore
//! use state_indexer::{ChangeDispatcher, IndexerRegistry, ReindexCoordinator};
//!
//! let registry = Arc::new(IndexerRegistry::new());
//! registry.register(Arc::new(my_indexer))?;
//!
//! let dispatcher = Arc::new(ChangeDispatcher::new(
//!     registry.clone(), store.clone(), (&settings).into(),
//! ));
//! let coordinator = Arc::new(ReindexCoordinator::new(
//!     registry, dispatcher.clone(), store.clone(), storage, (&settings).into(),
//! ));
//!
//! let feed = store.subscribe().await?;
//! tokio::spawn(coordinator.run(cancel.clone()));
//! dispatcher.run(feed, cancel).await;
//! ```

pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod indexer;
pub mod matcher;
pub mod memory_indexer;
pub mod registry;
pub mod retry;
pub mod state_store;
pub mod version_store;

pub use coordinator::{CoordinatorSummary, PlannedReindex, ReindexConfig, ReindexCoordinator};
pub use dispatcher::{
    ChangeDispatcher, DispatchOutcome, DispatchStats, DispatcherConfig, ReplaySummary,
};
pub use error::IndexingError;
pub use indexer::{Indexer, StateErrors};
pub use matcher::SubscriptionMatcher;
pub use memory_indexer::{MemoryIndexer, ProjectedEntry};
pub use registry::IndexerRegistry;
pub use retry::{retry_transient, RetryPolicy};
pub use state_store::{ChangeFeed, MemoryStateStore, StateStore};
pub use version_store::{MemoryVersionStore, VersionStore};

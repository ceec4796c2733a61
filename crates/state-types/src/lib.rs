//! # state-types
//!
//! Shared domain types for the state indexer.
//!
//! This crate defines the data structures exchanged between the state
//! store, the indexing core and indexer implementations:
//! - State records and change events
//! - Subscriptions and key matchers
//! - Reindex jobs and their lifecycle
//! - Version checkpoints
//! - Settings
//!
//! ## Usage
//!
//! ```rust
//! use state_types::{KeyMatcher, Subscription};
//!
//! let sub = Subscription::with_matcher("device", KeyMatcher::prefix("gw-"));
//! assert!(sub.matches("device", "gw-1"));
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod state;
pub mod subscription;
pub mod version;

pub use config::{DispatcherSettings, ReindexSettings, RetrySettings, Settings};
pub use error::TypesError;
pub use job::{JobProgress, JobStatus, ReindexJob};
pub use state::{StateChangeEvent, StateId, StateRecord};
pub use subscription::{KeyMatcher, Subscription};
pub use version::{Version, VersionRecord};

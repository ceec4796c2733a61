//! Subscription matching.
//!
//! Maps a state change to the set of indexers whose subscriptions cover it.
//! Built once per registry change and shared read-only afterwards.

use std::collections::{BTreeSet, HashMap};

use state_types::{KeyMatcher, StateChangeEvent};

use crate::indexer::Indexer;

/// Index of subscriptions keyed by state type.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionMatcher {
    by_type: HashMap<String, Vec<(String, Option<KeyMatcher>)>>,
}

impl SubscriptionMatcher {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a matcher over every subscription of the given indexers.
    pub fn from_indexers<'a, I>(indexers: I) -> Self
    where
        I: IntoIterator<Item = &'a dyn Indexer>,
    {
        let mut matcher = Self::new();
        for indexer in indexers {
            matcher.add(indexer);
        }
        matcher
    }

    /// Add the subscriptions of one indexer.
    pub fn add(&mut self, indexer: &dyn Indexer) {
        for subscription in indexer.subscriptions() {
            self.by_type
                .entry(subscription.state_type)
                .or_default()
                .push((indexer.id().to_string(), subscription.key_pattern));
        }
    }

    /// IDs of the indexers interested in an event, in ID order.
    pub fn match_event(&self, event: &StateChangeEvent) -> BTreeSet<String> {
        self.match_state(&event.state_type, &event.key)
    }

    /// IDs of the indexers interested in a state key, in ID order.
    ///
    /// Each indexer appears once even if several of its subscriptions match.
    pub fn match_state(&self, state_type: &str, key: &str) -> BTreeSet<String> {
        let Some(entries) = self.by_type.get(state_type) else {
            return BTreeSet::new();
        };

        entries
            .iter()
            .filter(|(_, pattern)| pattern.as_ref().map(|m| m.matches(key)).unwrap_or(true))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// State types with at least one subscriber.
    pub fn state_types(&self) -> BTreeSet<&str> {
        self.by_type.keys().map(String::as_str).collect()
    }

    /// Total number of subscriptions indexed.
    pub fn subscription_count(&self) -> usize {
        self.by_type.values().map(Vec::len).sum()
    }

    /// Check if no subscriptions are indexed.
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

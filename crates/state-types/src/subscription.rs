//! Subscriptions: the slice of state an indexer wants to see.

use serde::{Deserialize, Serialize};

/// Key filter applied within a single state type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum KeyMatcher {
    /// Matches exactly one key
    Exact(String),
    /// Matches every key starting with the prefix
    Prefix(String),
}

impl KeyMatcher {
    /// Create an exact-key matcher.
    pub fn exact(key: impl Into<String>) -> Self {
        KeyMatcher::Exact(key.into())
    }

    /// Create a prefix matcher.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        KeyMatcher::Prefix(prefix.into())
    }

    /// Check whether a key satisfies this matcher.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyMatcher::Exact(k) => k == key,
            KeyMatcher::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

/// Declared interest in records of one state type.
///
/// A subscription without a key pattern covers every key of the type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subscription {
    /// State type to receive
    pub state_type: String,
    /// Optional key filter within the type
    #[serde(default)]
    pub key_pattern: Option<KeyMatcher>,
}

impl Subscription {
    /// Subscribe to every key of a type.
    pub fn all(state_type: impl Into<String>) -> Self {
        Self {
            state_type: state_type.into(),
            key_pattern: None,
        }
    }

    /// Subscribe to a type, filtered by a key matcher.
    pub fn with_matcher(state_type: impl Into<String>, matcher: KeyMatcher) -> Self {
        Self {
            state_type: state_type.into(),
            key_pattern: Some(matcher),
        }
    }

    /// Check whether a record of the given type and key is covered.
    pub fn matches(&self, state_type: &str, key: &str) -> bool {
        self.state_type == state_type && self.matches_key(key)
    }

    /// Check only the key part, assuming the type already matched.
    pub fn matches_key(&self, key: &str) -> bool {
        self.key_pattern
            .as_ref()
            .map(|m| m.matches(key))
            .unwrap_or(true)
    }
}

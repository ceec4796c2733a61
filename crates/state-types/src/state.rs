//! State records and change events.
//!
//! Records are owned by the external state store. The indexing core only
//! ever sees immutable snapshots of them, passed by value.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a record within the state store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateId {
    /// State type (e.g. "device", "gateway_status")
    pub state_type: String,
    /// Key of the record within its type
    pub key: String,
}

impl StateId {
    /// Create a new state ID.
    pub fn new(state_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            state_type: state_type.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.state_type, self.key)
    }
}

/// Snapshot of a single record in the state store.
///
/// `version` is monotonic per key. A record with `deleted` set is a
/// tombstone and must still reach indexers so they can drop the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// State type
    pub state_type: String,
    /// Key within the type
    pub key: String,
    /// Opaque serialized value (empty for tombstones)
    #[serde(default)]
    pub value: Vec<u8>,
    /// Per-key version
    pub version: u64,
    /// Whether this record marks a deletion
    #[serde(default)]
    pub deleted: bool,
}

impl StateRecord {
    /// Create a live record.
    pub fn new(
        state_type: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
        version: u64,
    ) -> Self {
        Self {
            state_type: state_type.into(),
            key: key.into(),
            value: value.into(),
            version,
            deleted: false,
        }
    }

    /// Create a deletion marker.
    pub fn tombstone(state_type: impl Into<String>, key: impl Into<String>, version: u64) -> Self {
        Self {
            state_type: state_type.into(),
            key: key.into(),
            value: Vec::new(),
            version,
            deleted: true,
        }
    }

    /// Identity of this record.
    pub fn id(&self) -> StateId {
        StateId::new(self.state_type.clone(), self.key.clone())
    }
}

/// One entry of the state store's live change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    /// State type of the changed record
    pub state_type: String,
    /// Key of the changed record
    pub key: String,
    /// New per-key version
    pub version: u64,
    /// New value (empty on deletion)
    #[serde(default)]
    pub value: Vec<u8>,
    /// Whether the record was deleted
    #[serde(default)]
    pub deleted: bool,
}

impl StateChangeEvent {
    /// Identity of the changed record.
    pub fn id(&self) -> StateId {
        StateId::new(self.state_type.clone(), self.key.clone())
    }

    /// Snapshot of the record as of this change.
    pub fn to_record(&self) -> StateRecord {
        StateRecord {
            state_type: self.state_type.clone(),
            key: self.key.clone(),
            value: self.value.clone(),
            version: self.version,
            deleted: self.deleted,
        }
    }
}

impl From<StateRecord> for StateChangeEvent {
    fn from(record: StateRecord) -> Self {
        Self {
            state_type: record.state_type,
            key: record.key,
            version: record.version,
            value: record.value,
            deleted: record.deleted,
        }
    }
}

impl From<StateChangeEvent> for StateRecord {
    fn from(event: StateChangeEvent) -> Self {
        Self {
            state_type: event.state_type,
            key: event.key,
            value: event.value,
            version: event.version,
            deleted: event.deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_id_ordering_is_type_then_key() {
        let mut ids = vec![
            StateId::new("gateway", "a"),
            StateId::new("device", "d2"),
            StateId::new("device", "d1"),
        ];
        ids.sort();
        assert_eq!(ids[0], StateId::new("device", "d1"));
        assert_eq!(ids[1], StateId::new("device", "d2"));
        assert_eq!(ids[2], StateId::new("gateway", "a"));
    }

    #[test]
    fn test_state_id_display() {
        assert_eq!(StateId::new("device", "d1").to_string(), "device/d1");
    }

    #[test]
    fn test_tombstone_has_no_value() {
        let record = StateRecord::tombstone("device", "d1", 7);
        assert!(record.deleted);
        assert!(record.value.is_empty());
        assert_eq!(record.version, 7);
    }

    #[test]
    fn test_event_to_record_keeps_deleted_flag() {
        let event = StateChangeEvent {
            state_type: "device".to_string(),
            key: "d1".to_string(),
            version: 3,
            value: Vec::new(),
            deleted: true,
        };
        let record = event.to_record();
        assert!(record.deleted);
        assert_eq!(record.id(), event.id());
    }

    #[test]
    fn test_record_json_defaults() {
        let record: StateRecord =
            serde_json::from_str(r#"{"state_type":"device","key":"d1","version":5}"#).unwrap();
        assert!(!record.deleted);
        assert!(record.value.is_empty());
    }
}

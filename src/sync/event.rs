//! Order events exchanged between instances
//!
//! Each event travels as JSON in the single payload field of a stream
//! message:
//!
//! ```text
//!   {"source":"7f0c…","event_type":"add","event_id":"19ab…","metadata_id":42}
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{EntryId, IndexChange};
use crate::error::Result;

/// Kind of order change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    Add,
    Remove,
    Clear,
}

/// One order change published by an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Instance that made the change
    pub source: Uuid,
    pub event_type: SyncEventType,
    /// Unique per event
    pub event_id: Uuid,
    /// Affected entry; absent for clears
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_id: Option<EntryId>,
}

impl SyncEvent {
    fn new(source: Uuid, event_type: SyncEventType, metadata_id: Option<EntryId>) -> Self {
        Self {
            source,
            event_type,
            event_id: Uuid::new_v4(),
            metadata_id,
        }
    }

    pub fn add(source: Uuid, id: EntryId) -> Self {
        Self::new(source, SyncEventType::Add, Some(id))
    }

    pub fn remove(source: Uuid, id: EntryId) -> Self {
        Self::new(source, SyncEventType::Remove, Some(id))
    }

    pub fn clear(source: Uuid) -> Self {
        Self::new(source, SyncEventType::Clear, None)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// The index change this event describes, if well formed
    pub fn change(&self) -> Option<IndexChange> {
        match (self.event_type, self.metadata_id) {
            (SyncEventType::Add, Some(id)) => Some(IndexChange::Added(id)),
            (SyncEventType::Remove, Some(id)) => Some(IndexChange::Removed(id)),
            (SyncEventType::Clear, _) => Some(IndexChange::Cleared),
            _ => None,
        }
    }
}

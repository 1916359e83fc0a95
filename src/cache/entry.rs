//! Cache Entry Types
//!
//! Value types for stored items and for the position bookkeeping of the
//! logical order. Neither type knows which tier holds it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entry identifier - monotonic, unique, assigned at insert time
pub type EntryId = i64;

/// A stored item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<V> {
    /// Position in the global order
    id: EntryId,
    /// When the entry was first added
    created_at: DateTime<Utc>,
    /// Stored value
    value: V,
}

impl<V> Entry<V> {
    /// Create a new entry stamped with the current time
    pub fn new(id: EntryId, value: V) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            value,
        }
    }

    /// Create with an explicit timestamp (for tier transfers and decoding)
    pub fn with_created_at(id: EntryId, created_at: DateTime<Utc>, value: V) -> Self {
        Self {
            id,
            created_at,
            value,
        }
    }

    /// Entry id
    #[inline]
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Creation timestamp
    #[inline]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Borrow the value
    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Take the value
    pub fn into_value(self) -> V {
        self.value
    }

    /// A new entry with the same id and timestamp carrying `value`
    pub fn replaced(&self, value: V) -> Self {
        Self {
            id: self.id,
            created_at: self.created_at,
            value,
        }
    }
}

/// One node of the doubly linked logical order
///
/// Neighbours are referenced by id, never by pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataNode {
    /// Entry id this node positions
    pub id: EntryId,
    /// Previous id (None for the head)
    pub previous: Option<EntryId>,
    /// Next id (None for the tail)
    pub next: Option<EntryId>,
}

impl MetadataNode {
    /// A node not yet linked to any neighbour
    pub fn detached(id: EntryId) -> Self {
        Self {
            id,
            previous: None,
            next: None,
        }
    }

    #[inline]
    pub fn is_head(&self) -> bool {
        self.previous.is_none()
    }

    #[inline]
    pub fn is_tail(&self) -> bool {
        self.next.is_none()
    }
}

// =============================================================================
// Tests
// =============================================================================

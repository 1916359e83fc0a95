//! Tracked read positions of active subscriptions
//!
//! An entry can leave the shared cache once every subscription has read past
//! it. A subscription that has read nothing yet holds everything back.

use dashmap::DashMap;
use uuid::Uuid;

use crate::cache::EntryId;

/// Read position of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedIndex {
    pub id: Uuid,
    pub last_read_id: Option<EntryId>,
}

impl TrackedIndex {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            last_read_id: None,
        }
    }

    /// Whether this subscription is done with `id`
    pub fn has_passed(&self, id: EntryId) -> bool {
        self.last_read_id.is_some_and(|read| read >= id)
    }
}

/// How much of the cache may be evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evictable {
    /// No subscriptions: everything
    All,
    /// Every id up to and including this one
    Through(EntryId),
    /// Some subscription has not read anything
    Nothing,
}

impl Evictable {
    pub fn allows(&self, id: EntryId) -> bool {
        match self {
            Evictable::All => true,
            Evictable::Through(limit) => id <= *limit,
            Evictable::Nothing => false,
        }
    }
}

/// Concurrent registry of tracked indexes
#[derive(Debug, Default)]
pub struct Trackers {
    indexes: DashMap<Uuid, TrackedIndex>,
}

impl Trackers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid) {
        self.indexes.insert(id, TrackedIndex::new(id));
    }

    pub fn remove(&self, id: &Uuid) -> bool {
        self.indexes.remove(id).is_some()
    }

    /// Move a subscription's position forward; never moves it back
    pub fn record_read(&self, id: &Uuid, entry: EntryId) {
        if let Some(mut tracked) = self.indexes.get_mut(id) {
            if tracked.last_read_id.map_or(true, |read| entry > read) {
                tracked.last_read_id = Some(entry);
            }
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<TrackedIndex> {
        self.indexes.get(id).map(|tracked| *tracked)
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// The eviction boundary across all subscriptions
    pub fn evictable(&self) -> Evictable {
        let mut limit: Option<EntryId> = None;
        for tracked in self.indexes.iter() {
            match tracked.last_read_id {
                None => return Evictable::Nothing,
                Some(read) => limit = Some(limit.map_or(read, |current| current.min(read))),
            }
        }
        match limit {
            Some(limit) => Evictable::Through(limit),
            None => Evictable::All,
        }
    }

    pub fn is_evictable(&self, id: EntryId) -> bool {
        self.evictable().allows(id)
    }
}

//! Data Stores - L1 and L2 tiers
//!
//! Capacity-bounded id → entry maps. A store has no notion of order; the
//! order index owns that. Stores are not internally synchronized for writes:
//! mutation takes `&mut self` and the owning cache serializes all tiers under
//! one lock.
//!
//! # Capacity
//!
//! ```text
//!   min ≤ target ≤ max          (capped store)
//!   available = target - count
//!   target = None               (uncapped store, always has room)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::entry::{Entry, EntryId};
use crate::error::Result;

// =============================================================================
// Capacity
// =============================================================================

/// Soft capacity bounds of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// Floor for the target
    pub min: usize,
    /// Ceiling for the target
    pub max: usize,
    /// Current target (None = uncapped)
    pub target: Option<usize>,
}

impl Capacity {
    /// A capped capacity; `initial` is clamped into `[min, max]`
    pub fn bounded(initial: usize, min: usize, max: usize) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            target: Some(initial.clamp(min, max)),
        }
    }

    /// An uncapped capacity
    pub fn unbounded() -> Self {
        Self {
            min: 0,
            max: usize::MAX,
            target: None,
        }
    }

    /// Whether the store is capped
    #[inline]
    pub fn is_capped(&self) -> bool {
        self.target.is_some()
    }

    /// Remaining room for `count` stored entries (None when uncapped)
    #[inline]
    pub fn available(&self, count: usize) -> Option<usize> {
        self.target.map(|target| target.saturating_sub(count))
    }

    /// Whether one more entry fits
    #[inline]
    pub fn has_room(&self, count: usize) -> bool {
        match self.target {
            Some(target) => count < target,
            None => true,
        }
    }

    /// Grow the target by `n`, clamped to max. Returns the new target.
    pub fn grow(&mut self, n: usize) -> Option<usize> {
        if let Some(target) = self.target.as_mut() {
            *target = target.saturating_add(n).min(self.max);
        }
        self.target
    }

    /// Shrink the target by `n`, floored at min. Returns the new target.
    pub fn shrink(&mut self, n: usize) -> Option<usize> {
        if let Some(target) = self.target.as_mut() {
            *target = target.saturating_sub(n).max(self.min);
        }
        self.target
    }
}

// =============================================================================
// DataStore Port
// =============================================================================

/// Tier storage trait
///
/// Expected conditions are values, not errors: a missing id is `Ok(None)` and
/// a full store answers `Ok(false)` from [`DataStore::insert`]. Errors are
/// reserved for infrastructure faults.
#[async_trait]
pub trait DataStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Insert an entry. Replacing an existing id never consumes capacity.
    async fn insert(&mut self, entry: Entry<V>) -> Result<bool>;

    /// Replace an existing entry; false when the id is absent
    async fn update(&mut self, entry: Entry<V>) -> Result<bool>;

    /// Look up an entry by id
    async fn fetch(&self, id: EntryId) -> Result<Option<Entry<V>>>;

    /// Remove an entry, returning it
    async fn delete(&mut self, id: EntryId) -> Result<Option<Entry<V>>>;

    /// Remove everything
    async fn clear(&mut self) -> Result<()>;

    /// Number of stored entries
    async fn count(&self) -> Result<usize>;

    /// Whether the id is stored
    async fn contains(&self, id: EntryId) -> Result<bool> {
        Ok(self.fetch(id).await?.is_some())
    }

    /// Current capacity bounds
    fn capacity(&self) -> Capacity;

    /// Grow the target by `n` (clamped). Returns the new target.
    fn add_capacity(&mut self, n: usize) -> Option<usize>;

    /// Shrink the target by `n` (floored). Returns the new target.
    fn cut_capacity(&mut self, n: usize) -> Option<usize>;

    /// Human readable name for logs
    fn name(&self) -> &str;
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Hash map backed store used for L1 and as the default L2
pub struct MemoryStore<V> {
    name: String,
    entries: HashMap<EntryId, Entry<V>>,
    capacity: Capacity,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> MemoryStore<V> {
    /// Create an uncapped store
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::with_capacity(name, Capacity::unbounded())
    }

    /// Create a capped store
    pub fn bounded(name: impl Into<String>, initial: usize, min: usize, max: usize) -> Self {
        Self::with_capacity(name, Capacity::bounded(initial, min, max))
    }

    /// Create with explicit bounds
    pub fn with_capacity(name: impl Into<String>, capacity: Capacity) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<V> DataStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn insert(&mut self, entry: Entry<V>) -> Result<bool> {
        let id = entry.id();
        if let Some(existing) = self.entries.get_mut(&id) {
            *existing = entry;
            return Ok(true);
        }
        if !self.capacity.has_room(self.entries.len()) {
            return Ok(false);
        }
        self.entries.insert(id, entry);
        Ok(true)
    }

    async fn update(&mut self, entry: Entry<V>) -> Result<bool> {
        match self.entries.get_mut(&entry.id()) {
            Some(existing) => {
                *existing = entry;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fetch(&self, id: EntryId) -> Result<Option<Entry<V>>> {
        let entry = self.entries.get(&id).cloned();
        if entry.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(entry)
    }

    async fn delete(&mut self, id: EntryId) -> Result<Option<Entry<V>>> {
        Ok(self.entries.remove(&id))
    }

    async fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.len())
    }

    async fn contains(&self, id: EntryId) -> Result<bool> {
        Ok(self.entries.contains_key(&id))
    }

    fn capacity(&self) -> Capacity {
        self.capacity
    }

    fn add_capacity(&mut self, n: usize) -> Option<usize> {
        self.capacity.grow(n)
    }

    fn cut_capacity(&mut self, n: usize) -> Option<usize> {
        self.capacity.shrink(n)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// =============================================================================
// Tests
// =============================================================================

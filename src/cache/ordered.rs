//! Ordered Cache - two tiers, one order, blocking reads
//!
//! ```text
//!                      ┌──────────────────────────────┐
//!   add(value) ──────▶ │ RwLock<CacheState>           │
//!                      │   index  (order of ids)      │
//!                      │   L2     (every entry)       │
//!                      │   L1     (front of L2)       │
//!                      └──────────────┬───────────────┘
//!                                     │ signal(id)
//!                                     ▼
//!                      ┌──────────────────────────────┐
//!   get_next_async ──▶ │ WaitingRoom                  │
//!                      └──────────────────────────────┘
//! ```
//!
//! L2 is the store of record. L1 holds a contiguous run of the order
//! starting at the head and ending at `l1_tail`; whenever L1 gains room it is
//! refilled forward from L2. Every mutation takes the write lock, so ids are
//! assigned, stored and linked in one critical section.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::entry::{Entry, EntryId};
use super::index::{ChangeFeed, IndexChange, LinkedIndex, OrderIndex};
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use super::resizer::{AdaptiveResizer, Resizable, ResizePolicy};
use super::store::{Capacity, DataStore, MemoryStore};
use super::waiting_room::WaitingRoom;
use crate::config::CacheOptions;
use crate::error::{Error, Result};

// =============================================================================
// Shared State
// =============================================================================

struct CacheState<V> {
    l1: Option<Box<dyn DataStore<V>>>,
    l2: Box<dyn DataStore<V>>,
    index: Box<dyn OrderIndex>,
    /// Newest id resident in L1
    l1_tail: Option<EntryId>,
    disposed: bool,
}

pub(crate) struct CacheInner<V> {
    state: RwLock<CacheState<V>>,
    room: WaitingRoom<EntryId>,
    options: CacheOptions,
    metrics: CacheMetrics,
    disposed: AtomicBool,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl<V> Drop for CacheInner<V> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Ordered two-tier cache
///
/// Cloning is cheap; every clone refers to the same cache.
pub struct OrderedCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for OrderedCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> std::fmt::Debug for OrderedCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedCache")
            .field("disposed", &self.inner.disposed.load(Ordering::Relaxed))
            .field("room_generation", &self.inner.room.generation())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles an [`OrderedCache`] from its parts
pub struct OrderedCacheBuilder<V> {
    options: CacheOptions,
    l1: Option<Box<dyn DataStore<V>>>,
    l2: Option<Box<dyn DataStore<V>>>,
    index: Option<Box<dyn OrderIndex>>,
}

impl<V> OrderedCacheBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Use a custom L1 store
    pub fn l1(mut self, store: impl DataStore<V> + 'static) -> Self {
        self.l1 = Some(Box::new(store));
        self
    }

    /// Use a custom L2 store
    pub fn l2(mut self, store: impl DataStore<V> + 'static) -> Self {
        self.l2 = Some(Box::new(store));
        self
    }

    /// Use a custom order index
    pub fn index(mut self, index: impl OrderIndex + 'static) -> Self {
        self.index = Some(Box::new(index));
        self
    }

    /// Validate options, assemble the tiers and start background tasks
    ///
    /// Spawning the resizer or the remote-change pump requires a tokio
    /// runtime.
    pub fn build(self) -> Result<OrderedCache<V>> {
        self.options.validate()?;

        let options = self.options;
        let l2: Box<dyn DataStore<V>> = match self.l2 {
            Some(store) => store,
            None => Box::new(MemoryStore::unbounded("l2")),
        };
        let l1 = match self.l1 {
            Some(store) => Some(store),
            None if options.l1_enabled() => Some(Box::new(MemoryStore::bounded(
                "l1",
                options.l1_initial_capacity,
                options.min_cap,
                options.max_cap,
            )) as Box<dyn DataStore<V>>),
            None => None,
        };
        let mut index: Box<dyn OrderIndex> = match self.index {
            Some(index) => index,
            None => Box::new(LinkedIndex::new()),
        };

        let feed = index.take_feed();
        let run_resizer = options.run_adaptive_resizing
            && l1.as_ref().is_some_and(|store| store.capacity().is_capped());

        let metrics = CacheMetrics::new();
        if let Some(target) = l1.as_ref().and_then(|store| store.capacity().target) {
            metrics.set_l1_target(target);
        }

        let inner = Arc::new(CacheInner {
            state: RwLock::new(CacheState {
                l1,
                l2,
                index,
                l1_tail: None,
                disposed: false,
            }),
            room: WaitingRoom::new(),
            options,
            metrics,
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        });

        if run_resizer || feed.is_some() {
            let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
                Error::Internal(format!("ordered cache background tasks need a tokio runtime: {}", e))
            })?;
            let mut background = inner.background.lock();

            if run_resizer {
                let policy = ResizePolicy::from_options(&inner.options);
                let resizer = AdaptiveResizer::new(Arc::downgrade(&inner), policy);
                background.push(runtime.spawn(resizer.run(inner.shutdown.child_token())));
            }

            if let Some(feed) = feed {
                let wake = Arc::new(Notify::new());
                background.push(runtime.spawn(feed.run(inner.shutdown.child_token(), Arc::clone(&wake))));
                background.push(runtime.spawn(run_remote_pump(
                    Arc::downgrade(&inner),
                    wake,
                    inner.shutdown.child_token(),
                )));
            }
        }

        debug!(
            l1_capacity = inner.options.l1_initial_capacity,
            run_resizer,
            "Ordered cache built"
        );
        Ok(OrderedCache { inner })
    }
}

// =============================================================================
// Public API
// =============================================================================

impl<V> OrderedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Start assembling a cache
    pub fn builder(options: CacheOptions) -> OrderedCacheBuilder<V> {
        OrderedCacheBuilder {
            options,
            l1: None,
            l2: None,
            index: None,
        }
    }

    /// A cache with in-memory tiers and a local index
    pub fn in_memory(options: CacheOptions) -> Result<Self> {
        Self::builder(options).build()
    }

    /// Append a value, assigning it the next id
    #[instrument(skip(self, value))]
    pub async fn add(&self, value: V) -> Result<Entry<V>> {
        let timer = LatencyTracker::start();
        let mut state = self.inner.state.write().await;
        self.inner.ensure_live(&state)?;

        let reservation = state.index.reserve_id().await?;
        let id = reservation.id;
        let entry = Entry::new(id, value);

        let previous_tail = match self
            .inner
            .commit_locked(&mut state, entry.clone(), &reservation.applied)
            .await
        {
            Ok(previous_tail) => previous_tail,
            Err(e) => {
                if let Err(abandon_err) = state.index.abandon(id).await {
                    warn!("Failed to abandon reserved id {}: {}", id, abandon_err);
                }
                return Err(e);
            }
        };

        // Readers cannot observe the entry before the lock is released
        self.inner.room.signal(id);

        self.inner
            .fill_l1_after_add(&mut state, &entry, previous_tail)
            .await?;

        if let Some(window) = self.inner.options.evict_after_every_x {
            while state.index.len() > window {
                let Some(head) = state.index.head() else {
                    break;
                };
                self.inner.remove_locked(&mut state, head).await?;
                self.inner.metrics.record_rolling_eviction();
            }
        }

        self.inner.metrics.record_add(timer.elapsed());
        debug!(id, "Entry added");
        Ok(entry)
    }

    /// Replace the value stored under `id`, keeping id and timestamp
    pub async fn update(&self, id: EntryId, value: V) -> Result<Option<Entry<V>>> {
        let mut state = self.inner.state.write().await;
        self.inner.ensure_live(&state)?;

        let Some(current) = state.l2.fetch(id).await? else {
            return Ok(None);
        };
        let updated = current.replaced(value);
        if !state.l2.update(updated.clone()).await? {
            return Ok(None);
        }
        if let Some(l1) = state.l1.as_mut() {
            l1.update(updated.clone()).await?;
        }

        self.inner.metrics.record_update();
        Ok(Some(updated))
    }

    /// Look up an entry by id, L1 first
    pub async fn get_entry_or_default(&self, id: EntryId) -> Result<Option<Entry<V>>> {
        let state = self.inner.state.read().await;
        self.inner.ensure_live(&state)?;
        self.inner.fetch_locked(&state, id).await
    }

    /// The entry following `id` (the head when `id` is None)
    pub async fn get_next_or_default(&self, id: Option<EntryId>) -> Result<Option<Entry<V>>> {
        let state = self.inner.state.read().await;
        self.inner.ensure_live(&state)?;
        self.inner.next_entry_locked(&state, id).await
    }

    pub async fn get_first_or_default(&self) -> Result<Option<Entry<V>>> {
        self.get_next_or_default(None).await
    }

    pub async fn get_last_or_default(&self) -> Result<Option<Entry<V>>> {
        let state = self.inner.state.read().await;
        self.inner.ensure_live(&state)?;
        match state.index.tail() {
            Some(tail) => self.inner.fetch_locked(&state, tail).await,
            None => Ok(None),
        }
    }

    /// The entry following `id`, waiting for one to be added if needed
    ///
    /// Fails with [`Error::Cancelled`] when `token` fires and with
    /// [`Error::Disposed`] when the cache is disposed while waiting.
    pub async fn get_next_async(
        &self,
        id: Option<EntryId>,
        token: &CancellationToken,
    ) -> Result<Entry<V>> {
        loop {
            if token.is_cancelled() {
                self.inner.metrics.record_cancellation();
                return Err(Error::Cancelled);
            }

            let ticket = {
                let state = self.inner.state.read().await;
                self.inner.ensure_live(&state)?;
                if let Some(entry) = self.inner.next_entry_locked(&state, id).await? {
                    return Ok(entry);
                }
                // Joined under the read lock: no add can land between the
                // check above and the join
                self.inner.room.join()
            };

            self.inner.metrics.record_wait();
            match ticket.wait(token).await {
                Ok(_) => self.inner.metrics.record_wakeup(),
                Err(e) => {
                    if e.is_cancellation() {
                        self.inner.metrics.record_cancellation();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Wait for the first entry added after this call
    pub async fn get_future_first_or_default_async(
        &self,
        token: &CancellationToken,
    ) -> Result<Entry<V>> {
        let tail = self.tail_id().await?;
        self.get_next_async(tail, token).await
    }

    /// Remove an entry, refilling L1 from L2
    #[instrument(skip(self))]
    pub async fn remove(&self, id: EntryId) -> Result<Option<Entry<V>>> {
        let mut state = self.inner.state.write().await;
        self.inner.ensure_live(&state)?;
        let removed = self.inner.remove_locked(&mut state, id).await?;
        if removed.is_some() {
            self.inner.metrics.record_remove();
            debug!(id, "Entry removed");
        }
        Ok(removed)
    }

    /// Drop every entry. Ids keep counting from where they were.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.inner.state.write().await;
        self.inner.ensure_live(&state)?;
        self.inner.clear_locked(&mut state).await?;
        self.inner.metrics.record_clear();
        Ok(())
    }

    /// Number of entries
    pub async fn count(&self) -> Result<usize> {
        let state = self.inner.state.read().await;
        self.inner.ensure_live(&state)?;
        state.l2.count().await
    }

    /// Number of entries resident in L1
    pub async fn l1_count(&self) -> Result<usize> {
        let state = self.inner.state.read().await;
        self.inner.ensure_live(&state)?;
        match &state.l1 {
            Some(l1) => l1.count().await,
            None => Ok(0),
        }
    }

    /// L1 capacity bounds (None without L1)
    pub async fn l1_capacity(&self) -> Result<Option<Capacity>> {
        let state = self.inner.state.read().await;
        self.inner.ensure_live(&state)?;
        Ok(state.l1.as_ref().map(|l1| l1.capacity()))
    }

    pub async fn head_id(&self) -> Result<Option<EntryId>> {
        let state = self.inner.state.read().await;
        self.inner.ensure_live(&state)?;
        Ok(state.index.head())
    }

    pub async fn tail_id(&self) -> Result<Option<EntryId>> {
        let state = self.inner.state.read().await;
        self.inner.ensure_live(&state)?;
        Ok(state.index.tail())
    }

    /// Ids from head to tail
    pub async fn ids(&self) -> Result<Vec<EntryId>> {
        let state = self.inner.state.read().await;
        self.inner.ensure_live(&state)?;
        let mut ids = Vec::with_capacity(state.index.len());
        let mut cursor = None;
        while let Some(next) = state.index.next_id(cursor)? {
            ids.push(next);
            cursor = Some(next);
        }
        Ok(ids)
    }

    /// Readers currently blocked in [`OrderedCache::get_next_async`]
    pub fn waiting_readers(&self) -> usize {
        self.inner.room.waiting()
    }

    pub fn options(&self) -> &CacheOptions {
        &self.inner.options
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Stop background tasks, drop all data and release waiting readers
    ///
    /// Idempotent. Readers blocked in `get_next_async` fail with
    /// [`Error::Disposed`]; later calls on any clone do the same.
    #[instrument(skip(self))]
    pub async fn dispose(&self) -> Result<()> {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inner.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.background.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Cache background task ended abnormally: {}", e);
            }
        }

        let mut state = self.inner.state.write().await;
        let result = self.inner.clear_locked(&mut state).await;
        state.disposed = true;
        self.inner.room.close();
        drop(state);

        info!("Ordered cache disposed");
        result
    }

    /// Apply one resize step directly; used by hosts driving sizing themselves
    pub async fn resize_l1(&self, grow: bool, step: usize) -> Result<Option<usize>> {
        if grow {
            self.inner.grow_l1(step).await
        } else {
            self.inner.shrink_l1(step).await
        }
    }

    /// Signals that woke at least one blocked reader
    pub fn room_rate_count(&self) -> u64 {
        self.inner.room.waited_fires()
    }
}

// =============================================================================
// Locked Operations
// =============================================================================

impl<V> CacheInner<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn ensure_live(&self, state: &CacheState<V>) -> Result<()> {
        if state.disposed {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    /// Store and link a new entry. Returns the tail before the entry.
    async fn commit_locked(
        &self,
        state: &mut CacheState<V>,
        entry: Entry<V>,
        applied: &[IndexChange],
    ) -> Result<Option<EntryId>> {
        if !applied.is_empty() {
            self.apply_remote_locked(state, applied).await?;
        }

        let id = entry.id();
        if !state.l2.insert(entry).await? {
            return Err(Error::CapacityExhausted(format!(
                "{} refused entry {}",
                state.l2.name(),
                id
            )));
        }

        let previous_tail = state.index.tail();
        if let Err(e) = state.index.add_tail(id).await {
            if let Err(delete_err) = state.l2.delete(id).await {
                warn!("Failed to roll back entry {} from L2: {}", id, delete_err);
            }
            return Err(e);
        }
        Ok(previous_tail)
    }

    async fn fill_l1_after_add(
        &self,
        state: &mut CacheState<V>,
        entry: &Entry<V>,
        previous_tail: Option<EntryId>,
    ) -> Result<()> {
        let contiguous = state.l1_tail == previous_tail;
        let Some(l1) = state.l1.as_mut() else {
            return Ok(());
        };
        if !l1.capacity().has_room(l1.count().await?) {
            return Ok(());
        }

        if contiguous {
            if l1.insert(entry.clone()).await? {
                state.l1_tail = Some(entry.id());
            }
            Ok(())
        } else {
            self.replenish_locked(state).await.map(|_| ())
        }
    }

    async fn fetch_locked(&self, state: &CacheState<V>, id: EntryId) -> Result<Option<Entry<V>>> {
        if let Some(l1) = &state.l1 {
            if let Some(entry) = l1.fetch(id).await? {
                self.metrics.record_l1_hit();
                return Ok(Some(entry));
            }
            self.metrics.record_l1_miss();
        }

        let entry = state.l2.fetch(id).await?;
        if entry.is_some() {
            self.metrics.record_l2_hit();
        } else {
            self.metrics.record_l2_miss();
        }
        Ok(entry)
    }

    /// Resolve and fetch the successor of `id`, stepping over ids whose
    /// entry has gone missing from L2
    async fn next_entry_locked(
        &self,
        state: &CacheState<V>,
        id: Option<EntryId>,
    ) -> Result<Option<Entry<V>>> {
        let mut cursor = id;
        while let Some(next) = state.index.next_id(cursor)? {
            if let Some(entry) = self.fetch_locked(state, next).await? {
                return Ok(Some(entry));
            }
            warn!(id = next, "Indexed entry missing from L2, skipping");
            cursor = Some(next);
        }
        Ok(None)
    }

    async fn remove_locked(
        &self,
        state: &mut CacheState<V>,
        id: EntryId,
    ) -> Result<Option<Entry<V>>> {
        let node = state.index.node(id);
        let removed = state.l2.delete(id).await?;
        let unlinked = state.index.remove(id).await?;
        if removed.is_none() && !unlinked {
            return Ok(None);
        }

        if let Some(l1) = state.l1.as_mut() {
            l1.delete(id).await?;
            if state.l1_tail == Some(id) {
                state.l1_tail = node.and_then(|node| node.previous);
            }
            self.replenish_locked(state).await?;
        }
        Ok(removed)
    }

    async fn clear_locked(&self, state: &mut CacheState<V>) -> Result<()> {
        state.l2.clear().await?;
        if let Some(l1) = state.l1.as_mut() {
            l1.clear().await?;
        }
        state.l1_tail = None;
        state.index.clear().await?;
        Ok(())
    }

    /// Pull entries from L2 into L1 until L1 is full or the tail is reached
    async fn replenish_locked(&self, state: &mut CacheState<V>) -> Result<usize> {
        let CacheState {
            l1,
            l2,
            index,
            l1_tail,
            ..
        } = state;
        let Some(l1) = l1.as_mut() else {
            return Ok(0);
        };

        let mut pulled = 0;
        while l1.capacity().has_room(l1.count().await?) {
            let Some(next) = index.next_id(*l1_tail)? else {
                break;
            };
            if !l1.contains(next).await? {
                match l2.fetch(next).await? {
                    Some(entry) => {
                        if !l1.insert(entry).await? {
                            break;
                        }
                        pulled += 1;
                    }
                    None => warn!(id = next, "Entry missing from L2 during L1 replenish"),
                }
            }
            *l1_tail = Some(next);
        }

        if pulled > 0 {
            self.metrics.record_replenished(pulled);
            debug!(pulled, l1_tail = ?*l1_tail, "Replenished L1");
        }
        Ok(pulled)
    }

    /// Mirror order changes made by peers into L1. Returns the highest id
    /// added by a peer.
    async fn apply_remote_locked(
        &self,
        state: &mut CacheState<V>,
        changes: &[IndexChange],
    ) -> Result<Option<EntryId>> {
        let mut newest = None;
        for change in changes {
            match *change {
                IndexChange::Added(id) => {
                    newest = newest.max(Some(id));
                }
                IndexChange::Removed(id) => {
                    if let Some(l1) = state.l1.as_mut() {
                        l1.delete(id).await?;
                    }
                    if state.l1_tail == Some(id) {
                        state.l1_tail = None;
                    }
                }
                IndexChange::Cleared => {
                    if let Some(l1) = state.l1.as_mut() {
                        l1.clear().await?;
                    }
                    state.l1_tail = None;
                }
            }
        }

        self.metrics.record_remote_changes(changes.len());
        self.replenish_locked(state).await?;
        Ok(newest)
    }

    /// Drain the index's remote changes and wake readers for new entries
    async fn pump_remote(&self) -> Result<()> {
        let mut state = self.state.write().await;
        self.ensure_live(&state)?;

        let changes = state.index.drain_remote().await?;
        if changes.is_empty() {
            return Ok(());
        }

        let newest = self.apply_remote_locked(&mut state, &changes).await?;
        if let Some(id) = newest {
            self.room.signal(id);
        }
        debug!(changes = changes.len(), "Applied remote order changes");
        Ok(())
    }
}

#[async_trait]
impl<V> Resizable for CacheInner<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn waited_fires(&self) -> u64 {
        self.room.waited_fires()
    }

    async fn grow_l1(&self, step: usize) -> Result<Option<usize>> {
        let mut state = self.state.write().await;
        self.ensure_live(&state)?;
        let Some(l1) = state.l1.as_mut() else {
            return Ok(None);
        };

        let before = l1.capacity().target;
        let target = l1.add_capacity(step);
        if target != before {
            if let Some(target) = target {
                self.metrics.record_grow(target);
            }
            self.replenish_locked(&mut state).await?;
        }
        Ok(target)
    }

    async fn shrink_l1(&self, step: usize) -> Result<Option<usize>> {
        let mut state = self.state.write().await;
        self.ensure_live(&state)?;

        let CacheState {
            l1,
            index,
            l1_tail,
            ..
        } = &mut *state;
        let Some(l1) = l1.as_mut() else {
            return Ok(None);
        };

        let before = l1.capacity().target;
        let target = l1.cut_capacity(step);
        let Some(limit) = target else {
            return Ok(None);
        };
        if target != before {
            self.metrics.record_shrink(limit);
        }

        // Drop newest residents so L1 stays a run from the head
        while l1.count().await? > limit {
            let Some(id) = *l1_tail else {
                break;
            };
            l1.delete(id).await?;
            *l1_tail = index.node(id).and_then(|node| node.previous);
        }
        Ok(target)
    }
}

// =============================================================================
// Remote Pump
// =============================================================================

#[instrument(skip_all)]
async fn run_remote_pump<V>(inner: Weak<CacheInner<V>>, wake: Arc<Notify>, token: CancellationToken)
where
    V: Clone + Send + Sync + 'static,
{
    debug!("Remote change pump started");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = wake.notified() => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        match inner.pump_remote().await {
            Ok(()) => {}
            Err(e) if e.is_disposed() => break,
            Err(e) => warn!("Failed to apply remote order changes: {}", e),
        }
    }
    debug!("Remote change pump stopped");
}

// =============================================================================
// Tests
// =============================================================================

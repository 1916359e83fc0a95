//! Synchronized order index
//!
//! Several cache instances share one order. Ids come from a global tail key
//! guarded by the id-seed lock; every change is published on a stream and
//! mirrored by the peers.
//!
//! ```text
//!   reserve_id:  lock ─▶ GET tail (G) ─▶ catch up until local ≥ G ─▶ id = G+1
//!   add_tail:    link locally ─▶ SET tail ─▶ XADD add ─▶ unlock
//!   remove:      unlink locally ─▶ XADD remove
//!   clear:       reset locally ─▶ XADD clear
//!
//!   peer stream ──SyncListener──▶ inbox ──drain_remote──▶ local mirror
//! ```
//!
//! Each instance reads the stream through its own consumer group, so every
//! instance sees every event. Events an instance published itself are
//! skipped on the way in.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{StreamMessage, SyncBackend};
use super::event::SyncEvent;
use super::lock::{DistributedLock, LockToken};
use super::store::ids_key;
use crate::cache::{
    ChangeFeed, EntryId, IndexChange, LinkedIndex, MetadataNode, OrderIndex, Reservation,
};
use crate::config::SynchronizationOptions;
use crate::error::{Error, Result};

/// Peer events received but not yet applied
#[derive(Debug, Default)]
struct Inbox {
    events: Mutex<VecDeque<SyncEvent>>,
    arrived: Notify,
}

impl Inbox {
    fn push_all(&self, events: Vec<SyncEvent>) {
        if events.is_empty() {
            return;
        }
        self.events.lock().extend(events);
        self.arrived.notify_waiters();
    }

    fn take(&self) -> Vec<SyncEvent> {
        self.events.lock().drain(..).collect()
    }
}

fn parse_id(value: Option<String>) -> Result<EntryId> {
    match value {
        Some(value) => value
            .parse()
            .map_err(|_| Error::Backend(format!("global tail {:?} is not an id", value))),
        None => Ok(0),
    }
}

// =============================================================================
// Synced Index
// =============================================================================

pub struct SyncedIndex {
    backend: Arc<dyn SyncBackend>,
    options: SynchronizationOptions,
    source: Uuid,
    lock: DistributedLock,
    mirror: LinkedIndex,
    inbox: Arc<Inbox>,
    held: Option<LockToken>,
    /// Peer adds at or below this id predate the session
    floor: EntryId,
    feed: Option<SyncListener>,
}

impl SyncedIndex {
    /// Join the shared order
    ///
    /// With `resume_session` the local order is rebuilt from the shared id
    /// set; otherwise it starts empty just after the current global tail.
    pub async fn connect(
        backend: Arc<dyn SyncBackend>,
        options: SynchronizationOptions,
    ) -> Result<Self> {
        options.validate()?;
        backend
            .xgroup_create(&options.stream_key, &options.group_name)
            .await?;

        let global_tail = parse_id(backend.get(&options.global_tail_id_key).await?)?;
        let (mirror, floor) = if options.resume_session {
            let mut ids: Vec<EntryId> = backend
                .smembers(&ids_key(&options.namespace))
                .await?
                .iter()
                .filter_map(|member| member.parse().ok())
                .collect();
            ids.sort_unstable();

            let mut mirror = LinkedIndex::new();
            for id in ids {
                mirror.link_tail(id)?;
            }
            mirror.observe(global_tail);
            (mirror, 0)
        } else {
            (LinkedIndex::starting_after(global_tail), global_tail)
        };

        let source = Uuid::new_v4();
        let inbox = Arc::new(Inbox::default());
        let feed = SyncListener {
            backend: Arc::clone(&backend),
            stream: options.stream_key.clone(),
            group: options.group_name.clone(),
            consumer: options.consumer_name.clone(),
            batch: options.read_batch,
            block: options.read_block(),
            retry: options.max_backoff(),
            source,
            inbox: Arc::clone(&inbox),
        };

        info!(
            group = %options.group_name,
            resumed = options.resume_session,
            entries = mirror.size(),
            "Joined shared order at global tail {}",
            global_tail
        );

        Ok(Self {
            lock: DistributedLock::new(Arc::clone(&backend), &options),
            backend,
            options,
            source,
            mirror,
            inbox,
            held: None,
            floor,
            feed: Some(feed),
        })
    }

    /// Identity stamped on published events
    pub fn source(&self) -> Uuid {
        self.source
    }

    /// Ids in local order
    pub fn ids(&self) -> Vec<EntryId> {
        self.mirror.ids()
    }

    async fn publish(&self, event: SyncEvent) -> Result<()> {
        self.backend
            .xadd(
                &self.options.stream_key,
                &event.to_json()?,
                self.options.stream_max_len,
            )
            .await?;
        Ok(())
    }

    /// Advance the global tail to `id` and tell the peers
    async fn announce_add(&self, id: EntryId) -> Result<()> {
        self.backend
            .set(&self.options.global_tail_id_key, &id.to_string())
            .await?;
        self.publish(SyncEvent::add(self.source, id)).await
    }

    async fn release(&mut self) {
        if let Some(token) = self.held.take() {
            if let Err(e) = self.lock.release(&token).await {
                warn!("Failed to release id-seed lock: {}", e);
            }
        }
    }

    /// Apply one peer event to the mirror
    fn apply(&mut self, event: &SyncEvent) -> Result<Option<IndexChange>> {
        if event.source == self.source {
            return Ok(None);
        }
        let Some(change) = event.change() else {
            warn!(event = %event.event_id, "Skipping sync event without an id");
            return Ok(None);
        };

        let applied = match change {
            IndexChange::Added(id) if id <= self.floor => {
                self.mirror.observe(id);
                None
            }
            IndexChange::Added(id) => self.mirror.insert_ordered(id)?.then_some(change),
            IndexChange::Removed(id) => self.mirror.unlink(id).then_some(change),
            IndexChange::Cleared => {
                self.mirror.reset();
                Some(change)
            }
        };
        Ok(applied)
    }

    fn apply_inbox(&mut self, applied: &mut Vec<IndexChange>) -> Result<()> {
        for event in self.inbox.take() {
            if let Some(change) = self.apply(&event)? {
                applied.push(change);
            }
        }
        Ok(())
    }

    /// Apply peer events until every id up to `target` has been seen
    async fn catch_up(&mut self, target: EntryId) -> Result<Vec<IndexChange>> {
        let deadline = Instant::now() + self.options.catch_up_timeout();
        let inbox = Arc::clone(&self.inbox);
        let mut applied = Vec::new();

        loop {
            let arrived = inbox.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            self.apply_inbox(&mut applied)?;
            if self.mirror.last_assigned() >= target {
                return Ok(applied);
            }

            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                self.apply_inbox(&mut applied)?;
                if self.mirror.last_assigned() >= target {
                    return Ok(applied);
                }
                return Err(Error::SyncTimeout {
                    expected: target,
                    observed: self.mirror.last(),
                });
            }
        }
    }
}

#[async_trait]
impl OrderIndex for SyncedIndex {
    async fn reserve_id(&mut self) -> Result<Reservation> {
        let token = self.lock.acquire().await?;
        self.held = Some(token);

        let global_tail = self
            .backend
            .get(&self.options.global_tail_id_key)
            .await
            .and_then(parse_id);
        let caught_up = match global_tail {
            Ok(global_tail) => self.catch_up(global_tail).await,
            Err(e) => Err(e),
        };

        match caught_up {
            Ok(applied) => {
                let id = self.mirror.assign();
                debug!(id, caught_up = applied.len(), "Reserved id");
                Ok(Reservation { id, applied })
            }
            Err(e) => {
                self.release().await;
                Err(e)
            }
        }
    }

    async fn abandon(&mut self, id: EntryId) -> Result<()> {
        debug!(id, "Abandoning reserved id");
        self.release().await;
        Ok(())
    }

    async fn add_tail(&mut self, id: EntryId) -> Result<()> {
        self.mirror.link_tail(id)?;

        if let Err(e) = self.announce_add(id).await {
            self.mirror.unlink(id);
            return Err(e);
        }
        self.release().await;
        Ok(())
    }

    async fn remove(&mut self, id: EntryId) -> Result<bool> {
        if !self.mirror.unlink(id) {
            return Ok(false);
        }
        self.publish(SyncEvent::remove(self.source, id)).await?;
        Ok(true)
    }

    async fn clear(&mut self) -> Result<()> {
        self.mirror.reset();
        self.publish(SyncEvent::clear(self.source)).await
    }

    fn next_id(&self, id: Option<EntryId>) -> Result<Option<EntryId>> {
        self.mirror.successor(id)
    }

    fn head(&self) -> Option<EntryId> {
        self.mirror.first()
    }

    fn tail(&self) -> Option<EntryId> {
        self.mirror.last()
    }

    fn len(&self) -> usize {
        self.mirror.size()
    }

    fn contains(&self, id: EntryId) -> bool {
        self.mirror.has(id)
    }

    fn node(&self, id: EntryId) -> Option<MetadataNode> {
        self.mirror.get(id)
    }

    fn take_feed(&mut self) -> Option<Box<dyn ChangeFeed>> {
        self.feed
            .take()
            .map(|feed| Box::new(feed) as Box<dyn ChangeFeed>)
    }

    async fn drain_remote(&mut self) -> Result<Vec<IndexChange>> {
        let mut applied = Vec::new();
        self.apply_inbox(&mut applied)?;
        Ok(applied)
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Reads the event stream through this instance's consumer group
pub struct SyncListener {
    backend: Arc<dyn SyncBackend>,
    stream: String,
    group: String,
    consumer: String,
    batch: usize,
    block: Duration,
    retry: Duration,
    source: Uuid,
    inbox: Arc<Inbox>,
}

impl SyncListener {
    /// Decode a batch, keeping peer events. Returns the message ids to ack.
    fn accept(&self, messages: Vec<StreamMessage>) -> (Vec<String>, Vec<SyncEvent>) {
        let mut ids = Vec::with_capacity(messages.len());
        let mut events = Vec::new();
        for message in messages {
            match SyncEvent::from_json(&message.payload) {
                Ok(event) if event.source != self.source => events.push(event),
                Ok(_) => {}
                Err(e) => warn!("Dropping malformed sync event {}: {}", message.id, e),
            }
            ids.push(message.id);
        }
        (ids, events)
    }
}

#[async_trait]
impl ChangeFeed for SyncListener {
    async fn run(self: Box<Self>, token: CancellationToken, wake: Arc<Notify>) {
        debug!(group = %self.group, "Sync listener started");
        loop {
            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = self.backend.xreadgroup(
                    &self.stream,
                    &self.group,
                    &self.consumer,
                    self.batch,
                    Some(self.block),
                ) => read,
            };

            match read {
                Ok(messages) if messages.is_empty() => {}
                Ok(messages) => {
                    let (ids, events) = self.accept(messages);
                    if let Err(e) = self.backend.xack(&self.stream, &self.group, &ids).await {
                        warn!("Failed to acknowledge {} sync events: {}", ids.len(), e);
                    }
                    if !events.is_empty() {
                        debug!(events = events.len(), "Received peer order events");
                        self.inbox.push_all(events);
                        wake.notify_one();
                    }
                }
                Err(e) => {
                    warn!("Sync stream read failed: {}", e);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.retry) => {}
                    }
                }
            }
        }
        debug!(group = %self.group, "Sync listener stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================

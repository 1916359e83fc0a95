//! Shared backend port
//!
//! The handful of key/value, set and stream commands the order sync
//! protocol needs. Redis provides them natively; [`InMemorySyncBackend`]
//! reproduces their semantics inside one process so several caches can share
//! an order without a server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// One message read from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Stream-assigned id, used for acknowledgement
    pub id: String,
    /// The single payload field
    pub payload: String,
}

/// Shared backend trait
#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key. True when it existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Set only if absent, expiring after `ttl`. True when set.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete only if the current value equals `value`. True when deleted.
    async fn del_if_equals(&self, key: &str, value: &str) -> Result<bool>;

    /// Add to a set. True when newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove from a set. True when it was a member.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn scard(&self, key: &str) -> Result<usize>;

    /// Create a consumer group reading new messages, creating the stream if
    /// needed. An existing group is not an error.
    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<()>;

    /// Append a message, returning its id. With `max_len` the stream is
    /// trimmed to about that many of its newest messages.
    async fn xadd(&self, stream: &str, payload: &str, max_len: Option<usize>) -> Result<String>;

    /// Read messages not yet delivered to `group`, waiting up to `block`
    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>>;

    /// Acknowledge delivered messages. Returns how many were pending.
    async fn xack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize>;
}

// =============================================================================
// In-Memory Backend
// =============================================================================

#[derive(Debug, Default)]
struct GroupCursor {
    /// Stream position of the next undelivered message
    next: usize,
    pending: HashSet<String>,
}

#[derive(Debug, Default)]
struct StreamLog {
    messages: VecDeque<StreamMessage>,
    /// Position of `messages[0]` since the stream was created
    base: usize,
    groups: HashMap<String, GroupCursor>,
    sequence: u64,
}

impl StreamLog {
    fn end(&self) -> usize {
        self.base + self.messages.len()
    }

    fn trim(&mut self, max_len: usize) {
        while self.messages.len() > max_len {
            self.messages.pop_front();
            self.base += 1;
        }
    }
}

#[derive(Debug, Default)]
struct BackendState {
    strings: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, HashSet<String>>,
    streams: HashMap<String, StreamLog>,
}

impl BackendState {
    fn live_string(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(
            self.strings.get(key),
            Some((_, Some(expires))) if *expires <= Instant::now()
        );
        if expired {
            self.strings.remove(key);
            return None;
        }
        self.strings.get(key).map(|(value, _)| value)
    }

    fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        let log = self.streams.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
        let cursor = log.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        // Messages trimmed before this group read them are skipped
        let start = cursor.next.max(log.base);
        let end = (start + count).min(log.base + log.messages.len());
        let batch: Vec<StreamMessage> = log
            .messages
            .range(start - log.base..end - log.base)
            .cloned()
            .collect();
        cursor.next = end;
        cursor
            .pending
            .extend(batch.iter().map(|message| message.id.clone()));
        Ok(batch)
    }
}

fn no_group(stream: &str, group: &str) -> Error {
    Error::Backend(format!(
        "NOGROUP no consumer group {} for stream {}",
        group, stream
    ))
}

/// Process-local backend
#[derive(Debug, Default)]
pub struct InMemorySyncBackend {
    state: Mutex<BackendState>,
    appended: Notify,
}

impl InMemorySyncBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently held by `stream`
    pub fn stream_len(&self, stream: &str) -> usize {
        self.state
            .lock()
            .streams
            .get(stream)
            .map_or(0, |log| log.messages.len())
    }

    /// Messages delivered to `group` but not acknowledged
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.state
            .lock()
            .streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map_or(0, |cursor| cursor.pending.len())
    }
}

#[async_trait]
impl SyncBackend for InMemorySyncBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().live_string(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .lock()
            .strings
            .insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let existed = state.live_string(key).is_some();
        state.strings.remove(key);
        Ok(existed || state.sets.remove(key).is_some())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        if state.live_string(key).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(true)
    }

    async fn del_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if state.live_string(key).map(String::as_str) != Some(value) {
            return Ok(false);
        }
        state.strings.remove(key);
        Ok(true)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let removed = state
            .sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member));
        if state.sets.get(key).is_some_and(HashSet::is_empty) {
            state.sets.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        Ok(self.state.lock().sets.get(key).map_or(0, HashSet::len))
    }

    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<()> {
        let mut state = self.state.lock();
        let log = state.streams.entry(stream.to_string()).or_default();
        let start = log.end();
        log.groups
            .entry(group.to_string())
            .or_insert_with(|| GroupCursor {
                next: start,
                pending: HashSet::new(),
            });
        Ok(())
    }

    async fn xadd(&self, stream: &str, payload: &str, max_len: Option<usize>) -> Result<String> {
        let id = {
            let mut state = self.state.lock();
            let log = state.streams.entry(stream.to_string()).or_default();
            log.sequence += 1;
            let id = format!("{}-0", log.sequence);
            log.messages.push_back(StreamMessage {
                id: id.clone(),
                payload: payload.to_string(),
            });
            if let Some(max_len) = max_len {
                log.trim(max_len);
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>> {
        let deadline = block.map(|block| Instant::now() + block);

        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            // Register before checking so an append in between is not missed
            appended.as_mut().enable();

            let batch = self.state.lock().read_group(stream, group, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let Some(deadline) = deadline else {
                return Ok(batch);
            };
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn xack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize> {
        let mut state = self.state.lock();
        let Some(cursor) = state
            .streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
        else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| cursor.pending.remove(*id)).count())
    }
}

// =============================================================================
// Tests
// =============================================================================

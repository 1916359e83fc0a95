//! Waiting Room - one-shot broadcast used to wake blocked readers
//!
//! Any number of readers join the current room. The next signal resolves all
//! of them with the same value and installs a fresh room in the same critical
//! section, so a reader joining afterwards waits for the following signal
//! instead of seeing a stale value.
//!
//! ```text
//!   generation 4            signal(v)           generation 5
//!  ┌──────────────┐  ─────────────────────▶  ┌──────────────┐
//!  │ r1 r2 r3     │   r1 r2 r3 ← Fired(v)    │ (empty)      │
//!  └──────────────┘                          └──────────────┘
//! ```
//!
//! Each reader waits on its own `watch` receiver and its own cancellation
//! token, so cancelling one reader never disturbs the others. Closing the
//! room resolves every current and future joiner with `Closed`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// How a room ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomOutcome<T> {
    /// A new value was published
    Fired(T),
    /// The owner is shutting down
    Closed,
}

struct Room<T> {
    generation: u64,
    sender: watch::Sender<Option<RoomOutcome<T>>>,
}

impl<T> Room<T> {
    fn new(generation: u64) -> Self {
        let (sender, _) = watch::channel(None);
        Self { generation, sender }
    }
}

/// A reader's place in one room
pub struct Ticket<T> {
    generation: u64,
    receiver: watch::Receiver<Option<RoomOutcome<T>>>,
}

impl<T: Clone> Ticket<T> {
    /// Generation of the room this ticket belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Suspend until the room fires, closes, or `token` is cancelled
    pub async fn wait(mut self, token: &CancellationToken) -> Result<T> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            outcome = self.receiver.wait_for(Option::is_some) => match outcome {
                Ok(outcome) => match &*outcome {
                    Some(RoomOutcome::Fired(value)) => Ok(value.clone()),
                    Some(RoomOutcome::Closed) | None => Err(Error::Disposed),
                },
                // Sender gone without an outcome: the room was torn down
                Err(_) => Err(Error::Disposed),
            },
        }
    }
}

/// Generation-counted broadcast room
pub struct WaitingRoom<T> {
    current: Mutex<Room<T>>,
    closed: AtomicBool,
    /// Every signal
    fires: AtomicU64,
    /// Signals that woke at least one joiner
    waited_fires: AtomicU64,
}

impl<T: Clone> WaitingRoom<T> {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Room::new(0)),
            closed: AtomicBool::new(false),
            fires: AtomicU64::new(0),
            waited_fires: AtomicU64::new(0),
        }
    }

    /// Join the current room
    pub fn join(&self) -> Ticket<T> {
        let room = self.current.lock();
        Ticket {
            generation: room.generation,
            receiver: room.sender.subscribe(),
        }
    }

    /// Resolve every joiner of the current room with `value` and open a new
    /// room. Returns how many joiners were woken.
    pub fn signal(&self, value: T) -> usize {
        let mut room = self.current.lock();
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }

        let next = Room::new(room.generation + 1);
        let fired = std::mem::replace(&mut *room, next);
        drop(room);

        let joiners = fired.sender.receiver_count();
        fired.sender.send_replace(Some(RoomOutcome::Fired(value)));

        self.fires.fetch_add(1, Ordering::Relaxed);
        if joiners > 0 {
            self.waited_fires.fetch_add(1, Ordering::Relaxed);
        }
        joiners
    }

    /// Resolve every current and future joiner with `Closed`. Idempotent.
    pub fn close(&self) {
        let room = self.current.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        room.sender.send_replace(Some(RoomOutcome::Closed));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Generation of the room new joiners enter
    pub fn generation(&self) -> u64 {
        self.current.lock().generation
    }

    /// Readers currently waiting in the open room
    pub fn waiting(&self) -> usize {
        self.current.lock().sender.receiver_count()
    }

    /// Total number of signals
    pub fn fires(&self) -> u64 {
        self.fires.load(Ordering::Relaxed)
    }

    /// Signals that had at least one joiner (the room-rate numerator)
    pub fn waited_fires(&self) -> u64 {
        self.waited_fires.load(Ordering::Relaxed)
    }
}

impl<T: Clone> Default for WaitingRoom<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

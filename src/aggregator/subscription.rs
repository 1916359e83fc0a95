//! Subscriptions - per-subscriber feed and delivery loops
//!
//! ```text
//!   shared cache ──feed loop──▶ pending cache (ids) ──delivery loop──▶ on_next
//!                                                          │
//!                                        record_read + evict_ready
//! ```
//!
//! State machine:
//!
//! ```text
//!   Tracking ──loops start──▶ Delivering ──unsubscribe / dispose / failure──▶ Stopped
//! ```

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::hub::Core;
use crate::cache::{aggregate, Entry, EntryId, OrderedCache};
use crate::error::{Error, Result};

/// Receives the items of one type published to an aggregator
#[async_trait]
pub trait Subscriber<T>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    /// Handle one item. An error stops the subscription.
    async fn on_next(&self, item: Arc<T>) -> anyhow::Result<()>;

    /// The subscription ended without failure
    fn on_completed(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// The subscription ended because of `error`
    fn on_error(&self, _error: &Error) {}
}

/// Adapts a closure into a [`Subscriber`]
pub struct FnSubscriber<F> {
    f: F,
}

/// Subscribe with a plain closure
pub fn from_fn<T, F>(f: F) -> FnSubscriber<F>
where
    F: Fn(Arc<T>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    FnSubscriber { f }
}

#[async_trait]
impl<T, F> Subscriber<T> for FnSubscriber<F>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn on_next(&self, item: Arc<T>) -> anyhow::Result<()> {
        (self.f)(item)
    }
}

/// Lifecycle of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionState {
    Tracking = 0,
    Delivering = 1,
    Stopped = 2,
}

impl From<u8> for SubscriptionState {
    fn from(value: u8) -> Self {
        match value {
            0 => SubscriptionState::Tracking,
            1 => SubscriptionState::Delivering,
            _ => SubscriptionState::Stopped,
        }
    }
}

pub(crate) struct SubscriptionShared {
    id: Uuid,
    state: AtomicU8,
    delivered: AtomicU64,
    token: CancellationToken,
    stopped: CancellationToken,
    failure: Mutex<Option<Error>>,
}

impl SubscriptionShared {
    pub(crate) fn new(id: Uuid, token: CancellationToken) -> Self {
        Self {
            id,
            state: AtomicU8::new(SubscriptionState::Tracking as u8),
            delivered: AtomicU64::new(0),
            token,
            stopped: CancellationToken::new(),
            failure: Mutex::new(None),
        }
    }

    fn set_state(&self, state: SubscriptionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> SubscriptionState {
        SubscriptionState::from(self.state.load(Ordering::Acquire))
    }

    /// Ask the loops to stop
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolves once cleanup has finished
    pub(crate) async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    /// Record the first failure and stop the loops
    fn fail(&self, error: Error) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        self.token.cancel();
    }

    fn take_failure(&self) -> Option<Error> {
        self.failure.lock().take()
    }
}

/// Handle to a running subscription
///
/// Dropping the handle does not stop the subscription.
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    pub(crate) fn new(shared: Arc<SubscriptionShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() != SubscriptionState::Stopped
    }

    /// Items handed to `on_next` so far
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Stop the subscription and wait for its cleanup
    pub async fn unsubscribe(&self) {
        self.shared.cancel();
        self.shared.stopped().await;
    }

    /// Wait until the subscription stops on its own
    pub async fn stopped(&self) {
        self.shared.stopped().await;
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("delivered", &self.delivered())
            .finish()
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Marks the subscription stopped even if the runner unwinds
struct StopGuard(Arc<SubscriptionShared>);

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.0.set_state(SubscriptionState::Stopped);
        self.0.stopped.cancel();
    }
}

pub(crate) struct SubscriptionRunner<T, S> {
    core: Arc<Core>,
    shared: Arc<SubscriptionShared>,
    subscriber: S,
    pending: OrderedCache<EntryId>,
    start: Option<EntryId>,
    _item: PhantomData<fn() -> T>,
}

impl<T, S> SubscriptionRunner<T, S>
where
    T: Send + Sync + 'static,
    S: Subscriber<T>,
{
    pub(crate) fn new(
        core: Arc<Core>,
        shared: Arc<SubscriptionShared>,
        subscriber: S,
        pending: OrderedCache<EntryId>,
        start: Option<EntryId>,
    ) -> Self {
        Self {
            core,
            shared,
            subscriber,
            pending,
            start,
            _item: PhantomData,
        }
    }

    pub(crate) async fn run(self) {
        let _guard = StopGuard(Arc::clone(&self.shared));
        self.shared.set_state(SubscriptionState::Delivering);
        debug!(subscription = %self.shared.id, start = ?self.start, "Subscription delivering");

        let (_, outcome) = tokio::join!(self.feed(), self.deliver_all());
        if let Err(e) = outcome {
            if !matches!(e, Error::AggregationAborted { .. }) {
                self.shared.fail(e);
            }
        }

        self.finish().await;
    }

    /// Copy ids from the shared cache into the pending cache
    async fn feed(&self) {
        let entries = self
            .core
            .cache
            .enumerate_entries_async(self.start, self.shared.token.clone());
        futures::pin_mut!(entries);

        while let Some(entry) = entries.next().await {
            let result = match entry {
                Ok(entry) => self.pending.add(entry.id()).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                if !e.ends_wait() {
                    self.shared.fail(e);
                }
                break;
            }
        }
    }

    async fn deliver_all(&self) -> Result<u64> {
        let pending = self
            .pending
            .enumerate_entries_async(None, self.shared.token.clone());
        aggregate(pending, |entry| self.deliver(entry), &self.shared.token).await
    }

    /// Hand one pending id to the subscriber. False stops delivery.
    async fn deliver(&self, pending: Entry<EntryId>) -> bool {
        let id = *pending.value();

        let entry = match self.core.cache.get_entry_or_default(id).await {
            Ok(entry) => entry,
            Err(e) => {
                if !e.ends_wait() {
                    self.shared.fail(e);
                }
                return false;
            }
        };

        if let Some(entry) = entry {
            let item: Arc<dyn Any + Send + Sync> = Arc::clone(entry.value());
            if let Ok(item) = item.downcast::<T>() {
                // A subscriber stuck in on_next must not outlive cancellation
                let outcome = tokio::select! {
                    biased;
                    _ = self.shared.token.cancelled() => {
                        debug!(subscription = %self.shared.id, id, "Delivery abandoned on stop");
                        return false;
                    }
                    outcome = self.subscriber.on_next(item) => outcome,
                };
                if let Err(reason) = outcome {
                    self.shared.fail(Error::DeliveryFailed {
                        subscription: self.shared.id,
                        id,
                        reason: format!("{:#}", reason),
                    });
                    return false;
                }
                self.shared.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.core.trackers.record_read(&self.shared.id, id);
        if let Err(e) = self.pending.remove(pending.id()).await {
            if !e.ends_wait() {
                warn!(subscription = %self.shared.id, "Failed to drop delivered id {}: {}", id, e);
            }
        }
        if let Err(e) = self.core.evict_ready().await {
            if !e.ends_wait() {
                warn!("Eviction after delivery of {} failed: {}", id, e);
            }
        }
        true
    }

    async fn finish(&self) {
        let id = self.shared.id;
        self.core.trackers.remove(&id);
        self.core.subscriptions.remove(&id);

        if let Err(e) = self.core.evict_ready().await {
            if !e.ends_wait() {
                warn!(subscription = %id, "Eviction sweep failed: {}", e);
            }
        }
        if let Err(e) = self.pending.dispose().await {
            error!(subscription = %id, "Failed to dispose pending cache: {}", e);
        }

        match self.shared.take_failure() {
            Some(failure) => {
                error!(subscription = %id, "Subscription aborted: {}", failure);
                self.subscriber.on_error(&failure);
            }
            None => {
                if let Err(e) = self.subscriber.on_completed() {
                    error!(subscription = %id, "Subscriber completion failed: {:#}", e);
                }
                info!(
                    subscription = %id,
                    delivered = self.shared.delivered.load(Ordering::Relaxed),
                    "Subscription completed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            SubscriptionState::Tracking,
            SubscriptionState::Delivering,
            SubscriptionState::Stopped,
        ] {
            assert_eq!(SubscriptionState::from(state as u8), state);
        }
    }

    #[test]
    fn test_first_failure_wins() {
        let shared = SubscriptionShared::new(Uuid::new_v4(), CancellationToken::new());
        shared.fail(Error::Internal("first".into()));
        shared.fail(Error::Internal("second".into()));

        assert!(shared.token.is_cancelled());
        let failure = shared.take_failure().unwrap();
        assert!(failure.to_string().contains("first"));
        assert!(shared.take_failure().is_none());
    }

    #[tokio::test]
    async fn test_stop_guard_marks_stopped() {
        let shared = Arc::new(SubscriptionShared::new(
            Uuid::new_v4(),
            CancellationToken::new(),
        ));
        let subscription = Subscription::new(Arc::clone(&shared));
        assert_eq!(subscription.state(), SubscriptionState::Tracking);

        drop(StopGuard(shared));
        subscription.stopped().await;
        assert!(!subscription.is_active());
    }

    #[tokio::test]
    async fn test_fn_subscriber_forwards() {
        let subscriber = from_fn(|item: Arc<u32>| {
            anyhow::ensure!(*item < 10, "too large: {}", item);
            Ok(())
        });

        assert!(subscriber.on_next(Arc::new(3u32)).await.is_ok());
        assert!(subscriber.on_next(Arc::new(30u32)).await.is_err());
        assert!(Subscriber::<u32>::on_completed(&subscriber).is_ok());
    }
}

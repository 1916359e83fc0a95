//! Aggregator - publish once, deliver to every subscription
//!
//! Items live in one shared ordered cache. Each subscription tracks how far
//! it has read; the evictable prefix of the cache (every id all
//! subscriptions have passed) is removed after each delivery, and anyone
//! awaiting one of those ids is released.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::subscription::{Subscriber, Subscription, SubscriptionRunner, SubscriptionShared};
use super::tracked::Trackers;
use crate::cache::{EntryId, MetricsSnapshot, OrderedCache};
use crate::config::AggregatorOptions;
use crate::error::{Error, Result};

/// Type-erased published item
pub type Item = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryStatus {
    Pending,
    Delivered,
    Disposed,
}

/// State shared between the aggregator and its subscription tasks
pub(crate) struct Core {
    pub(crate) cache: OrderedCache<Item>,
    pub(crate) trackers: Trackers,
    pub(crate) subscriptions: DashMap<Uuid, Arc<SubscriptionShared>>,
    awaiters: DashMap<EntryId, watch::Sender<DeliveryStatus>>,
    evict_lock: tokio::sync::Mutex<()>,
    closing: AtomicBool,
}

impl Core {
    /// Remove every entry all subscriptions have read past
    pub(crate) async fn evict_ready(&self) -> Result<usize> {
        let _evicting = self.evict_lock.lock().await;
        let mut evicted = 0;

        while !self.closing.load(Ordering::Acquire) {
            let Some(head) = self.cache.head_id().await? else {
                break;
            };
            if !self.trackers.is_evictable(head) {
                break;
            }
            if self.cache.remove(head).await?.is_some() {
                evicted += 1;
            }
            self.resolve(head, DeliveryStatus::Delivered);
        }

        if evicted > 0 {
            debug!(evicted, "Evicted delivered items");
        }
        Ok(evicted)
    }

    fn resolve(&self, id: EntryId, status: DeliveryStatus) {
        if let Some((_, sender)) = self.awaiters.remove(&id) {
            sender.send_replace(status);
        }
    }
}

/// Fan-out of published items to typed subscribers
pub struct Aggregator {
    core: Arc<Core>,
    options: AggregatorOptions,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("options", &self.options)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    /// Create an aggregator with its shared cache
    pub fn new(options: AggregatorOptions) -> Result<Self> {
        options.validate()?;
        let cache = OrderedCache::in_memory(options.cache.clone())?;

        Ok(Self {
            core: Arc::new(Core {
                cache,
                trackers: Trackers::new(),
                subscriptions: DashMap::new(),
                awaiters: DashMap::new(),
                evict_lock: tokio::sync::Mutex::new(()),
                closing: AtomicBool::new(false),
            }),
            options,
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    /// Whether anyone would receive a published item
    pub fn can_publish(&self) -> bool {
        !self.disposed.load(Ordering::Acquire) && !self.core.trackers.is_empty()
    }

    /// Publish an item. Returns its tracking id, or None when nobody listens.
    pub async fn publish<T>(&self, item: T) -> Result<Option<EntryId>>
    where
        T: Send + Sync + 'static,
    {
        self.ensure_live()?;
        if !self.can_publish() {
            return Ok(None);
        }

        let item: Item = Arc::new(item);
        let entry = self.core.cache.add(item).await?;
        Ok(Some(entry.id()))
    }

    /// Start delivering items of type `T` published from now on
    #[instrument(skip(self, subscriber))]
    pub async fn subscribe<T, S>(&self, subscriber: S) -> Result<Subscription>
    where
        T: Send + Sync + 'static,
        S: Subscriber<T>,
    {
        self.ensure_live()?;

        let id = Uuid::new_v4();
        self.core.trackers.register(id);

        let prepared = async {
            let start = self.core.cache.tail_id().await?;
            let pending = OrderedCache::in_memory(self.options.pending.clone())?;
            Ok::<_, Error>((start, pending))
        };
        let (start, pending) = match prepared.await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.core.trackers.remove(&id);
                return Err(e);
            }
        };

        // Items already in the cache are never delivered here
        if let Some(tail) = start {
            self.core.trackers.record_read(&id, tail);
        }

        let shared = Arc::new(SubscriptionShared::new(id, self.shutdown.child_token()));
        self.core.subscriptions.insert(id, Arc::clone(&shared));

        let runner = SubscriptionRunner::<T, S>::new(
            Arc::clone(&self.core),
            Arc::clone(&shared),
            subscriber,
            pending,
            start,
        );
        tokio::spawn(runner.run());

        info!(subscription = %id, ?start, "Subscription started");
        Ok(Subscription::new(shared))
    }

    /// Resolve once every subscription has passed `id`
    ///
    /// Returns at once when the item is already gone.
    pub async fn await_delivery(&self, id: EntryId, token: &CancellationToken) -> Result<()> {
        self.ensure_live()?;

        let mut receiver = self
            .core
            .awaiters
            .entry(id)
            .or_insert_with(|| watch::channel(DeliveryStatus::Pending).0)
            .subscribe();

        // Registered first, so an eviction after this lookup still resolves us
        if self.core.cache.get_entry_or_default(id).await?.is_none() {
            self.core.resolve(id, DeliveryStatus::Delivered);
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            status = receiver.wait_for(|status| *status != DeliveryStatus::Pending) => {
                match status.map(|status| *status) {
                    Ok(DeliveryStatus::Delivered) => Ok(()),
                    _ => Err(Error::Disposed),
                }
            }
        }
    }

    pub fn tracker_count(&self) -> usize {
        self.core.trackers.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.core.subscriptions.len()
    }

    /// Published items not yet evicted
    pub async fn pending_deliveries(&self) -> Result<usize> {
        self.core.cache.count().await
    }

    /// Whether `id` is still held for a subscription that has not passed it
    pub async fn is_retained(&self, id: EntryId) -> Result<bool> {
        self.ensure_live()?;
        Ok(self.core.cache.get_entry_or_default(id).await?.is_some())
    }

    /// Metrics of the shared item cache
    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.cache.metrics()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop every subscription, release awaiters and dispose the cache
    #[instrument(skip(self))]
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.core.closing.store(true, Ordering::Release);

        let subscriptions: Vec<Arc<SubscriptionShared>> = self
            .core
            .subscriptions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for subscription in &subscriptions {
            subscription.cancel();
        }
        for subscription in &subscriptions {
            subscription.stopped().await;
        }
        self.shutdown.cancel();

        let waiting: Vec<EntryId> = self.core.awaiters.iter().map(|entry| *entry.key()).collect();
        for id in waiting {
            self.core.resolve(id, DeliveryStatus::Disposed);
        }

        self.core.cache.dispose().await?;
        info!(
            subscriptions = subscriptions.len(),
            "Aggregator disposed"
        );
        Ok(())
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::subscription::from_fn;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn aggregator() -> Aggregator {
        Aggregator::new(AggregatorOptions::default()).unwrap()
    }

    async fn settle(aggregator: &Aggregator) {
        for _ in 0..200 {
            if aggregator.pending_deliveries().await.unwrap() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let aggregator = aggregator();
        assert!(!aggregator.can_publish());
        assert_eq!(aggregator.publish(1u32).await.unwrap(), None);
        assert_eq!(aggregator.pending_deliveries().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_typed_delivery_and_eviction() {
        let aggregator = aggregator();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = aggregator
            .subscribe(from_fn(move |item: Arc<u32>| {
                sink.lock().push(*item);
                Ok(())
            }))
            .await
            .unwrap();
        assert!(aggregator.can_publish());

        aggregator.publish(1u32).await.unwrap().unwrap();
        aggregator.publish("ignored".to_string()).await.unwrap().unwrap();
        let last = aggregator.publish(2u32).await.unwrap().unwrap();

        aggregator
            .await_delivery(last, &CancellationToken::new())
            .await
            .unwrap();
        settle(&aggregator).await;

        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(subscription.delivered(), 2);
        assert_eq!(aggregator.pending_deliveries().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let aggregator = aggregator();
        let failing = aggregator
            .subscribe(from_fn(|_: Arc<u32>| -> anyhow::Result<()> {
                anyhow::bail!("broken")
            }))
            .await
            .unwrap();
        let healthy = aggregator
            .subscribe(from_fn(|_: Arc<u32>| Ok(())))
            .await
            .unwrap();

        for i in 0..5u32 {
            aggregator.publish(i).await.unwrap();
        }

        failing.stopped().await;
        assert!(!failing.is_active());
        settle(&aggregator).await;

        assert_eq!(healthy.delivered(), 5);
        assert_eq!(aggregator.tracker_count(), 1);
        assert_eq!(aggregator.pending_deliveries().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_tracker() {
        let aggregator = aggregator();
        let subscription = aggregator
            .subscribe(from_fn(|_: Arc<u32>| Ok(())))
            .await
            .unwrap();
        assert_eq!(aggregator.tracker_count(), 1);

        subscription.unsubscribe().await;
        assert!(!subscription.is_active());
        assert_eq!(aggregator.tracker_count(), 0);
        assert_eq!(aggregator.subscription_count(), 0);
        assert!(!aggregator.can_publish());
    }

    #[tokio::test]
    async fn test_await_delivery_of_unknown_id_returns() {
        let aggregator = aggregator();
        aggregator
            .await_delivery(404, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dispose_releases_awaiters() {
        let aggregator = Arc::new(aggregator());
        let gate = Arc::new(tokio::sync::Notify::new());
        let blocked = Arc::clone(&gate);

        struct Blocking(Arc<tokio::sync::Notify>);

        #[async_trait::async_trait]
        impl Subscriber<u32> for Blocking {
            async fn on_next(&self, _item: Arc<u32>) -> anyhow::Result<()> {
                self.0.notified().await;
                Ok(())
            }
        }

        let subscription = aggregator.subscribe(Blocking(blocked)).await.unwrap();
        let id = aggregator.publish(7u32).await.unwrap().unwrap();

        let waiter = {
            let aggregator = Arc::clone(&aggregator);
            tokio::spawn(async move {
                aggregator
                    .await_delivery(id, &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let disposing = {
            let aggregator = Arc::clone(&aggregator);
            tokio::spawn(async move { aggregator.dispose().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        disposing.await.unwrap().unwrap();
        assert_matches!(waiter.await.unwrap(), Err(Error::Disposed));
        assert!(!subscription.is_active());
        assert_matches!(aggregator.publish(1u32).await, Err(Error::Disposed));
        aggregator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_abandons_stuck_subscriber() {
        let aggregator = Arc::new(aggregator());

        struct Stuck;

        #[async_trait::async_trait]
        impl Subscriber<u32> for Stuck {
            async fn on_next(&self, _item: Arc<u32>) -> anyhow::Result<()> {
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let subscription = aggregator.subscribe(Stuck).await.unwrap();
        let id = aggregator.publish(1u32).await.unwrap().unwrap();
        let waiter = {
            let aggregator = Arc::clone(&aggregator);
            tokio::spawn(async move {
                aggregator
                    .await_delivery(id, &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), aggregator.dispose())
            .await
            .expect("dispose waited on a stuck subscriber")
            .unwrap();
        assert!(!subscription.is_active());
        assert_eq!(subscription.delivered(), 0);
        assert_matches!(waiter.await.unwrap(), Err(Error::Disposed));
    }

    #[tokio::test]
    async fn test_unsubscribe_abandons_stuck_subscriber() {
        let aggregator = aggregator();

        struct Stuck;

        #[async_trait::async_trait]
        impl Subscriber<u32> for Stuck {
            async fn on_next(&self, _item: Arc<u32>) -> anyhow::Result<()> {
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let subscription = aggregator.subscribe(Stuck).await.unwrap();
        let id = aggregator.publish(1u32).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), subscription.unsubscribe())
            .await
            .expect("unsubscribe waited on a stuck subscriber");
        // With no trackers left the item is evicted
        aggregator
            .await_delivery(id, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!aggregator.is_retained(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_await_delivery_cancel() {
        let aggregator = aggregator();
        let gate = Arc::new(tokio::sync::Notify::new());

        struct Gated(Arc<tokio::sync::Notify>);

        #[async_trait::async_trait]
        impl Subscriber<u8> for Gated {
            async fn on_next(&self, _item: Arc<u8>) -> anyhow::Result<()> {
                self.0.notified().await;
                Ok(())
            }
        }

        aggregator.subscribe(Gated(Arc::clone(&gate))).await.unwrap();
        let id = aggregator.publish(1u8).await.unwrap().unwrap();

        // The subscriber has not finished with the item, so it is still held
        let token = CancellationToken::new();
        token.cancel();
        assert_matches!(
            aggregator.await_delivery(id, &token).await,
            Err(Error::Cancelled)
        );

        gate.notify_one();
        aggregator
            .await_delivery(id, &CancellationToken::new())
            .await
            .unwrap();
    }
}

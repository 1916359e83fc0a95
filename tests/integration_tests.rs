//! Orderly Integration Tests
//!
//! End-to-end behaviour through the public API:
//! - Ordered cache: id assignment, blocking reads, L1 sizing, disposal
//! - Aggregator: fan-out and eviction
//! - Distributed sync: several caches sharing one order

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tokio_util::sync::CancellationToken;

use orderly::{CacheOptions, Error, OrderedCache};

fn small_l1(capacity: usize) -> CacheOptions {
    CacheOptions {
        l1_initial_capacity: capacity,
        min_cap: 1,
        max_cap: capacity * 4,
        ..CacheOptions::default()
    }
}

/// Poll `check` until it holds or five seconds pass
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_for_readers<V>(cache: &OrderedCache<V>, readers: usize)
where
    V: Clone + Send + Sync + 'static,
{
    eventually(|| async move { cache.waiting_readers() == readers }).await
}

// =============================================================================
// Ordered Cache
// =============================================================================

mod cache_tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_concurrent_adds_get_unique_contiguous_ids() {
        let cache = OrderedCache::in_memory(small_l1(64)).unwrap();

        let handles: Vec<_> = (0..1000u32)
            .map(|n| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.add(n).await.unwrap().id() })
            })
            .collect();

        let mut ids = Vec::with_capacity(handles.len());
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();

        assert_eq!(ids, (1..=1000).collect::<Vec<_>>());
        assert_eq!(cache.ids().await.unwrap(), ids);
        assert_eq!(cache.count().await.unwrap(), 1000);
        assert_eq!(cache.l1_count().await.unwrap(), 64);
    }

    #[tokio::test]
    async fn test_blocked_reader_wakes_on_add() {
        let cache: OrderedCache<String> = OrderedCache::in_memory(small_l1(8)).unwrap();
        let token = CancellationToken::new();

        let reader = {
            let cache = cache.clone();
            let token = token.clone();
            tokio::spawn(async move { cache.get_next_async(None, &token).await })
        };
        wait_for_readers(&cache, 1).await;

        let added = cache.add("first".to_string()).await.unwrap();
        let read = reader.await.unwrap().unwrap();
        assert_eq!(read.id(), added.id());
        assert_eq!(read.value(), "first");

        // A cursor behind the tail resolves without waiting
        cache.add("second".to_string()).await.unwrap();
        let next = cache.get_next_async(Some(added.id()), &token).await.unwrap();
        assert_eq!(next.value(), "second");
        assert_eq!(cache.waiting_readers(), 0);
    }

    #[tokio::test]
    async fn test_cancelling_one_reader_leaves_others_waiting() {
        let cache: OrderedCache<u64> = OrderedCache::in_memory(small_l1(8)).unwrap();
        let cancelled = CancellationToken::new();
        let patient = CancellationToken::new();

        let spawn_reader = |token: CancellationToken| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_next_async(None, &token).await })
        };
        let first = spawn_reader(cancelled.clone());
        let second = spawn_reader(patient.clone());
        wait_for_readers(&cache, 2).await;

        cancelled.cancel();
        assert_matches!(first.await.unwrap(), Err(Error::Cancelled));

        cache.add(7).await.unwrap();
        assert_eq!(*second.await.unwrap().unwrap().value(), 7);
    }

    #[tokio::test]
    async fn test_parallel_insert_read_remove_drains() {
        let cache = OrderedCache::in_memory(small_l1(32)).unwrap();

        let handles: Vec<_> = (0..1000u64)
            .map(|n| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let entry = cache.add(n).await.unwrap();
                    let read = cache.get_entry_or_default(entry.id()).await.unwrap();
                    assert_eq!(read.map(|e| *e.value()), Some(n));
                    cache.remove(entry.id()).await.unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }
        assert_eq!(cache.count().await.unwrap(), 0);
        assert_eq!(cache.l1_count().await.unwrap(), 0);
        assert_eq!(cache.head_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rolling_window_keeps_newest() {
        let options = CacheOptions {
            evict_after_every_x: Some(1),
            ..small_l1(4)
        };
        let cache = OrderedCache::in_memory(options).unwrap();

        let token = CancellationToken::new();
        let mut cursor = None;
        for n in 0..5u32 {
            cache.add(n).await.unwrap();
            assert_eq!(cache.count().await.unwrap(), 1);

            let latest = cache.get_next_async(cursor, &token).await.unwrap();
            assert_eq!(*latest.value(), n);
            cursor = Some(latest.id());
        }
        assert_eq!(cache.head_id().await.unwrap(), cache.tail_id().await.unwrap());
    }

    #[tokio::test]
    async fn test_enumeration_follows_order() {
        let cache = OrderedCache::in_memory(small_l1(2)).unwrap();
        for n in 0..6u32 {
            cache.add(n).await.unwrap();
        }

        let values: Vec<u32> = cache
            .enumerate_values(None)
            .map(|value| value.unwrap())
            .collect()
            .await;
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);

        let token = CancellationToken::new();
        let live = cache.enumerate_future_entries_async(token.clone()).await.unwrap();
        cache.add(99).await.unwrap();
        let mut live = Box::pin(live);
        assert_eq!(*live.next().await.unwrap().unwrap().value(), 99);
        token.cancel();
        assert!(live.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_cache_shrinks_l1_to_minimum() {
        let options = CacheOptions {
            l1_initial_capacity: 32,
            run_adaptive_resizing: true,
            adaption_window_ms: 20,
            shrink_step: 8,
            min_cap: 4,
            max_cap: 64,
            room_rate_lower_limit: 1,
            room_rate_upper_limit: 10,
            ..CacheOptions::default()
        };
        let cache = OrderedCache::in_memory(options).unwrap();
        for n in 0..32u32 {
            cache.add(n).await.unwrap();
        }
        assert_eq!(cache.l1_count().await.unwrap(), 32);

        tokio::time::sleep(Duration::from_millis(500)).await;

        let capacity = cache.l1_capacity().await.unwrap().unwrap();
        assert_eq!(capacity.target, Some(4));
        assert_eq!(cache.l1_count().await.unwrap(), 4);
        // L1 still holds the head of the order
        assert_eq!(cache.count().await.unwrap(), 32);
        assert_eq!(*cache.get_first_or_default().await.unwrap().unwrap().value(), 0);
        cache.dispose().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_readers_grow_l1() {
        let options = CacheOptions {
            l1_initial_capacity: 4,
            run_adaptive_resizing: true,
            adaption_window_ms: 200,
            grow_step: 4,
            min_cap: 4,
            max_cap: 64,
            room_rate_lower_limit: 0,
            room_rate_upper_limit: 2,
            ..CacheOptions::default()
        };
        let cache = OrderedCache::in_memory(options).unwrap();
        let token = CancellationToken::new();

        for n in 0..10u32 {
            let tail = cache.tail_id().await.unwrap();
            let reader = {
                let cache = cache.clone();
                let token = token.clone();
                tokio::spawn(async move { cache.get_next_async(tail, &token).await })
            };
            wait_for_readers(&cache, 1).await;
            cache.add(n).await.unwrap();
            assert_eq!(*reader.await.unwrap().unwrap().value(), n);
        }

        tokio::time::sleep(Duration::from_millis(500)).await;

        let target = cache.l1_capacity().await.unwrap().unwrap().target.unwrap();
        assert!(target > 4, "L1 target stayed at {}", target);
        assert!(target <= 64);
        cache.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_resize_is_clamped() {
        let cache: OrderedCache<u8> = OrderedCache::in_memory(small_l1(8)).unwrap();

        assert_eq!(cache.resize_l1(true, 1000).await.unwrap(), Some(32));
        assert_eq!(cache.resize_l1(false, 1000).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_dispose_releases_waiters_and_is_idempotent() {
        let cache: OrderedCache<u32> = OrderedCache::in_memory(small_l1(8)).unwrap();
        let token = CancellationToken::new();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let cache = cache.clone();
                let token = token.clone();
                tokio::spawn(async move { cache.get_next_async(None, &token).await })
            })
            .collect();
        wait_for_readers(&cache, 3).await;

        cache.dispose().await.unwrap();
        cache.dispose().await.unwrap();

        for waiter in waiters {
            assert_matches!(waiter.await.unwrap(), Err(Error::Disposed));
        }
        assert!(cache.is_disposed());
        assert_matches!(cache.add(1).await, Err(Error::Disposed));
    }
}

// =============================================================================
// Aggregator
// =============================================================================

mod aggregator_tests {
    use super::*;
    use orderly::aggregator::from_fn;
    use orderly::{Aggregator, AggregatorOptions};
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_every_subscriber_sees_every_item_in_order() {
        let aggregator = Aggregator::new(AggregatorOptions::default()).unwrap();

        let mut received = Vec::new();
        for _ in 0..3 {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            aggregator
                .subscribe(from_fn(move |item: Arc<u64>| {
                    sink.lock().push(*item);
                    Ok(())
                }))
                .await
                .unwrap();
            received.push(seen);
        }
        assert_eq!(aggregator.tracker_count(), 3);

        let mut last = None;
        for n in 0..100u64 {
            last = aggregator.publish(n).await.unwrap();
        }
        aggregator
            .await_delivery(last.unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        for seen in &received {
            assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
        }
        assert_eq!(aggregator.pending_deliveries().await.unwrap(), 0);
        aggregator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribers_only_receive_their_type() {
        let aggregator = Aggregator::new(AggregatorOptions::default()).unwrap();
        let numbers = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&numbers);
        let subscription = aggregator
            .subscribe(from_fn(move |item: Arc<i32>| {
                sink.lock().push(*item);
                Ok(())
            }))
            .await
            .unwrap();

        aggregator.publish("skip me".to_string()).await.unwrap();
        let last = aggregator.publish(5i32).await.unwrap().unwrap();
        aggregator
            .await_delivery(last, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*numbers.lock(), vec![5]);
        assert_eq!(subscription.delivered(), 1);
        aggregator.dispose().await.unwrap();
        assert!(!subscription.is_active());
    }

    /// Handles one item per permit released on the gate
    struct Gated(Arc<tokio::sync::Semaphore>);

    #[async_trait::async_trait]
    impl orderly::Subscriber<u32> for Gated {
        async fn on_next(&self, _item: Arc<u32>) -> anyhow::Result<()> {
            self.0.acquire().await?.forget();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_holds_items_the_fast_one_passed() {
        let aggregator = Aggregator::new(AggregatorOptions::default()).unwrap();
        let fast_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fast_seen);
        aggregator
            .subscribe(from_fn(move |item: Arc<u32>| {
                sink.lock().push(*item);
                Ok(())
            }))
            .await
            .unwrap();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let slow = aggregator.subscribe(Gated(Arc::clone(&gate))).await.unwrap();

        let mut ids = Vec::new();
        for n in 0..3u32 {
            ids.push(aggregator.publish(n).await.unwrap().unwrap());
        }
        eventually(|| {
            let fast_seen = &fast_seen;
            async move { fast_seen.lock().len() == 3 }
        })
        .await;

        for id in &ids {
            assert!(aggregator.is_retained(*id).await.unwrap());
        }
        assert_eq!(aggregator.pending_deliveries().await.unwrap(), 3);
        assert_eq!(slow.delivered(), 0);

        gate.add_permits(3);
        aggregator
            .await_delivery(ids[2], &CancellationToken::new())
            .await
            .unwrap();

        for id in &ids {
            assert!(!aggregator.is_retained(*id).await.unwrap());
        }
        assert_eq!(slow.delivered(), 3);
        aggregator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_rolling_window_is_rejected() {
        let options = AggregatorOptions {
            pending: CacheOptions {
                evict_after_every_x: Some(1),
                ..CacheOptions::default()
            },
            ..AggregatorOptions::default()
        };
        assert_matches!(Aggregator::new(options), Err(Error::Config(_)));
    }
}

// =============================================================================
// Distributed Sync
// =============================================================================

mod sync_tests {
    use super::*;
    use futures::StreamExt;
    use orderly::sync::{connect_cache, InMemorySyncBackend, SyncBackend};
    use orderly::SynchronizationOptions;

    fn sync_options() -> SynchronizationOptions {
        SynchronizationOptions {
            resume_session: false,
            read_block_ms: 20,
            ..SynchronizationOptions::default()
        }
    }

    async fn pair() -> (OrderedCache<String>, OrderedCache<String>) {
        let backend: Arc<dyn SyncBackend> = Arc::new(InMemorySyncBackend::new());
        let options = sync_options();
        let a = connect_cache(Arc::clone(&backend), options.clone(), small_l1(16))
            .await
            .unwrap();
        let b = connect_cache(backend, options.for_new_instance(), small_l1(16))
            .await
            .unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_instances_observe_the_same_order() {
        let (a, b) = pair().await;
        let (a, b) = (&a, &b);

        assert_eq!(a.add("a1".to_string()).await.unwrap().id(), 1);
        assert_eq!(b.add("b1".to_string()).await.unwrap().id(), 2);
        assert_eq!(a.add("a2".to_string()).await.unwrap().id(), 3);

        eventually(|| async move { b.ids().await.unwrap() == vec![1, 2, 3] }).await;
        eventually(|| async move { a.ids().await.unwrap() == vec![1, 2, 3] }).await;

        let values: Vec<String> = b
            .enumerate_values(None)
            .map(|value| value.unwrap())
            .collect()
            .await;
        assert_eq!(values, vec!["a1", "b1", "a2"]);
        assert_eq!(a.count().await.unwrap(), 3);

        a.dispose().await.unwrap();
        b.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_wakes_on_peer_add() {
        let (a, b) = pair().await;
        let token = CancellationToken::new();

        let reader = {
            let b = b.clone();
            let token = token.clone();
            tokio::spawn(async move { b.get_next_async(None, &token).await })
        };
        wait_for_readers(&b, 1).await;

        a.add("from a".to_string()).await.unwrap();
        let entry = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(entry.value(), "from a");

        a.dispose().await.unwrap();
        b.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_removal_and_clear_propagate() {
        let (a, b) = pair().await;
        let (a, b) = (&a, &b);
        let first = a.add("one".to_string()).await.unwrap().id();
        let second = a.add("two".to_string()).await.unwrap().id();
        eventually(|| async move { b.ids().await.unwrap() == vec![first, second] }).await;

        a.remove(first).await.unwrap();
        eventually(|| async move { b.ids().await.unwrap() == vec![second] }).await;
        assert!(b.get_entry_or_default(first).await.unwrap().is_none());

        b.clear().await.unwrap();
        eventually(|| async move { a.ids().await.unwrap().is_empty() }).await;
        assert_eq!(a.count().await.unwrap(), 0);

        // Ids keep counting after a clear
        assert!(a.add("three".to_string()).await.unwrap().id() > second);

        a.dispose().await.unwrap();
        b.dispose().await.unwrap();
    }
}

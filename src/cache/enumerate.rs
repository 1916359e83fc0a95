//! Async Enumeration over an ordered cache
//!
//! Finite streams walk from a cursor to the tail as it is when they reach it.
//! Infinite streams keep going, suspending in `get_next_async` whenever they
//! catch up, and end quietly when their token fires or the cache is disposed.

use std::future::Future;

use async_stream::stream;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::entry::{Entry, EntryId};
use super::ordered::OrderedCache;
use crate::error::{Error, Result};

impl<V> OrderedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Entries after `start` up to the current tail
    pub fn enumerate_entries(
        &self,
        start: Option<EntryId>,
    ) -> impl Stream<Item = Result<Entry<V>>> + Send + 'static {
        let cache = self.clone();
        stream! {
            let mut cursor = start;
            loop {
                match cache.get_next_or_default(cursor).await {
                    Ok(Some(entry)) => {
                        cursor = Some(entry.id());
                        yield Ok(entry);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }

    /// Values after `start` up to the current tail
    pub fn enumerate_values(
        &self,
        start: Option<EntryId>,
    ) -> impl Stream<Item = Result<V>> + Send + 'static {
        self.enumerate_entries(start)
            .map(|entry| entry.map(Entry::into_value))
    }

    /// Entries after `start`, waiting for new ones forever
    pub fn enumerate_entries_async(
        &self,
        start: Option<EntryId>,
        token: CancellationToken,
    ) -> impl Stream<Item = Result<Entry<V>>> + Send + 'static {
        let cache = self.clone();
        stream! {
            let mut cursor = start;
            loop {
                match cache.get_next_async(cursor, &token).await {
                    Ok(entry) => {
                        cursor = Some(entry.id());
                        yield Ok(entry);
                    }
                    Err(e) if e.ends_wait() => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }

    /// Values after `start`, waiting for new ones forever
    pub fn enumerate_values_async(
        &self,
        start: Option<EntryId>,
        token: CancellationToken,
    ) -> impl Stream<Item = Result<V>> + Send + 'static {
        self.enumerate_entries_async(start, token)
            .map(|entry| entry.map(Entry::into_value))
    }

    /// Entries added after this call
    ///
    /// The tail is captured before returning, so anything added once the
    /// future resolves is seen even if the stream is polled later.
    pub async fn enumerate_future_entries_async(
        &self,
        token: CancellationToken,
    ) -> Result<impl Stream<Item = Result<Entry<V>>> + Send + 'static> {
        let tail = self.tail_id().await?;
        Ok(self.enumerate_entries_async(tail, token))
    }
}

/// Fold a stream with a predicate that can stop it
///
/// Returns the number of items accepted. A `false` from `f` ends with
/// [`Error::AggregationAborted`] carrying the rejected item's position;
/// a cancelled token ends with the count so far.
pub async fn aggregate<S, T, F, Fut>(stream: S, mut f: F, token: &CancellationToken) -> Result<u64>
where
    S: Stream<Item = Result<T>>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = bool>,
{
    futures::pin_mut!(stream);
    let mut position = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(position),
            next = stream.next() => next,
        };

        match next {
            None => return Ok(position),
            Some(Err(e)) => return Err(e),
            Some(Ok(item)) => {
                if !f(item).await {
                    return Err(Error::AggregationAborted { position });
                }
                position += 1;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheOptions;
    use assert_matches::assert_matches;
    use futures::TryStreamExt;

    fn cache() -> OrderedCache<u32> {
        OrderedCache::in_memory(CacheOptions {
            l1_initial_capacity: 4,
            min_cap: 1,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_finite_enumeration_stops_at_tail() {
        let cache = cache();
        for value in 10..15 {
            cache.add(value).await.unwrap();
        }

        let values: Vec<u32> = cache.enumerate_values(None).try_collect().await.unwrap();
        assert_eq!(values, vec![10, 11, 12, 13, 14]);

        let ids: Vec<EntryId> = cache
            .enumerate_entries(Some(3))
            .map_ok(|entry| entry.id())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_async_enumeration_follows_new_entries() {
        let cache = cache();
        let token = CancellationToken::new();
        cache.add(1).await.unwrap();

        let reader = {
            let stream = cache.enumerate_values_async(None, token.clone());
            tokio::spawn(async move { stream.take(3).try_collect::<Vec<u32>>().await })
        };

        cache.add(2).await.unwrap();
        cache.add(3).await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_async_enumeration_ends_on_cancel_and_dispose() {
        let cache = cache();
        cache.add(1).await.unwrap();

        let token = CancellationToken::new();
        let cancelled = {
            let stream = cache.enumerate_values_async(None, token.clone());
            tokio::spawn(async move { stream.try_collect::<Vec<u32>>().await })
        };
        let disposed = {
            let stream = cache.enumerate_values_async(None, CancellationToken::new());
            tokio::spawn(async move { stream.try_collect::<Vec<u32>>().await })
        };

        while cache.waiting_readers() < 2 {
            tokio::task::yield_now().await;
        }
        token.cancel();
        assert_eq!(cancelled.await.unwrap().unwrap(), vec![1]);

        cache.dispose().await.unwrap();
        assert_eq!(disposed.await.unwrap().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_future_enumeration_skips_existing() {
        let cache = cache();
        cache.add(1).await.unwrap();
        cache.add(2).await.unwrap();

        let token = CancellationToken::new();
        let stream = cache
            .enumerate_future_entries_async(token.clone())
            .await
            .unwrap();
        cache.add(3).await.unwrap();

        let first: Vec<Entry<u32>> = stream.take(1).try_collect().await.unwrap();
        assert_eq!(*first[0].value(), 3);
    }

    #[tokio::test]
    async fn test_aggregate_counts_and_aborts() {
        let cache = cache();
        for value in 0..5 {
            cache.add(value).await.unwrap();
        }
        let token = CancellationToken::new();

        let count = aggregate(cache.enumerate_values(None), |_| async { true }, &token)
            .await
            .unwrap();
        assert_eq!(count, 5);

        let result = aggregate(
            cache.enumerate_values(None),
            |value| async move { value < 3 },
            &token,
        )
        .await;
        assert_matches!(result, Err(Error::AggregationAborted { position: 3 }));
    }

    #[tokio::test]
    async fn test_aggregate_stops_on_cancel() {
        let cache = cache();
        let token = CancellationToken::new();
        token.cancel();

        let count = aggregate(
            cache.enumerate_values_async(None, CancellationToken::new()),
            |_| async { true },
            &token,
        )
        .await
        .unwrap();
        assert_eq!(count, 0);
    }
}

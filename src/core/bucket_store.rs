//! Shared storage for rate-limit buckets
//!
//! Workers never lock a bucket. They read it, then issue conditional updates
//! that the store evaluates against the value it holds at write time.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::clock::{Clock, SystemClock};
use crate::core::errors::Result;
use crate::core::models::RateLimitBucket;

/// Outcome of a conditional decrement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecrementOutcome {
    pub success: bool,
    /// Tokens left after the write, or the untouched balance on failure
    pub new_available: f64,
}

/// Globally shared bucket counters with atomic conditional primitives
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Current bucket row, `None` when absent or expired
    async fn read_bucket(&self, key: &str) -> Result<Option<RateLimitBucket>>;

    /// Insert the bucket unless one already exists. Returns whether it was inserted.
    async fn create_bucket(&self, bucket: RateLimitBucket) -> Result<bool>;

    /// Add refilled tokens (capped at capacity) and move `last_refill_ms` to
    /// `now_ms`, only if nobody refilled since `expected_last_refill_ms`.
    async fn refill_bucket(
        &self,
        key: &str,
        expected_last_refill_ms: u64,
        added_tokens: f64,
        now_ms: u64,
    ) -> Result<bool>;

    /// Subtract `amount` only if the balance at write time is at least `amount`
    async fn try_decrement(&self, key: &str, amount: f64) -> Result<DecrementOutcome>;

    /// Drop buckets idle past their TTL. Returns how many were removed.
    async fn reclaim_idle(&self, now_ms: u64) -> Result<usize>;
}

/// Process-local bucket store; the mutex makes each primitive atomic
#[derive(Debug, Clone)]
pub struct InMemoryBucketStore {
    buckets: Arc<Mutex<HashMap<String, RateLimitBucket>>>,
    /// Rows past their TTL read as absent, like a TTL-expiring table
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryBucketStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn is_expired(&self, bucket: &RateLimitBucket) -> bool {
        bucket.expires_at_ms <= self.clock.now_millis()
    }

    /// Stored rows, including expired ones not yet reclaimed
    pub async fn len(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn read_bucket(&self, key: &str) -> Result<Option<RateLimitBucket>> {
        let buckets = self.buckets.lock().await;
        Ok(buckets
            .get(key)
            .filter(|bucket| !self.is_expired(bucket))
            .cloned())
    }

    async fn create_bucket(&self, bucket: RateLimitBucket) -> Result<bool> {
        let mut buckets = self.buckets.lock().await;
        match buckets.get(&bucket.bucket_key) {
            Some(existing) if !self.is_expired(existing) => Ok(false),
            _ => {
                debug!(bucket = %bucket.bucket_key, capacity = bucket.capacity, "Created bucket");
                buckets.insert(bucket.bucket_key.clone(), bucket);
                Ok(true)
            }
        }
    }

    async fn refill_bucket(
        &self,
        key: &str,
        expected_last_refill_ms: u64,
        added_tokens: f64,
        now_ms: u64,
    ) -> Result<bool> {
        let mut buckets = self.buckets.lock().await;
        let Some(bucket) = buckets.get_mut(key) else {
            return Ok(false);
        };
        if bucket.last_refill_ms != expected_last_refill_ms || now_ms < bucket.last_refill_ms {
            return Ok(false);
        }

        bucket.available_tokens = (bucket.available_tokens + added_tokens.max(0.0)).min(bucket.capacity);
        bucket.last_refill_ms = now_ms;
        bucket.expires_at_ms = now_ms.saturating_add(bucket.ttl_ms);
        Ok(true)
    }

    async fn try_decrement(&self, key: &str, amount: f64) -> Result<DecrementOutcome> {
        let mut buckets = self.buckets.lock().await;
        let Some(bucket) = buckets.get_mut(key) else {
            return Ok(DecrementOutcome {
                success: false,
                new_available: 0.0,
            });
        };

        if bucket.available_tokens >= amount {
            bucket.available_tokens -= amount;
            bucket.expires_at_ms = self.clock.now_millis().saturating_add(bucket.ttl_ms);
            Ok(DecrementOutcome {
                success: true,
                new_available: bucket.available_tokens,
            })
        } else {
            Ok(DecrementOutcome {
                success: false,
                new_available: bucket.available_tokens,
            })
        }
    }

    async fn reclaim_idle(&self, now_ms: u64) -> Result<usize> {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.expires_at_ms > now_ms);
        Ok(before - buckets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::clock::ManualClock;

    fn bucket(capacity: f64) -> RateLimitBucket {
        RateLimitBucket::full("api-rpm", capacity, 1.0, 60_000, 1_000)
    }

    fn store_at(millis: u64) -> (InMemoryBucketStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(millis));
        (InMemoryBucketStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_create_is_put_if_absent() {
        let (store, _clock) = store_at(1_000);
        assert!(store.create_bucket(bucket(5.0)).await.unwrap());
        assert!(!store.create_bucket(bucket(9.0)).await.unwrap());

        let stored = store.read_bucket("api-rpm").await.unwrap().unwrap();
        assert_eq!(stored.capacity, 5.0);
    }

    #[tokio::test]
    async fn test_decrement_never_goes_below_zero() {
        let (store, _clock) = store_at(1_000);
        store.create_bucket(bucket(2.0)).await.unwrap();

        let first = store.try_decrement("api-rpm", 1.5).await.unwrap();
        assert!(first.success);
        assert_eq!(first.new_available, 0.5);

        let second = store.try_decrement("api-rpm", 1.0).await.unwrap();
        assert!(!second.success);
        assert_eq!(second.new_available, 0.5);
    }

    #[tokio::test]
    async fn test_refill_is_conditional_and_capped() {
        let (store, _clock) = store_at(1_000);
        store.create_bucket(bucket(5.0)).await.unwrap();
        store.try_decrement("api-rpm", 4.0).await.unwrap();

        // Stale expectation loses
        assert!(!store.refill_bucket("api-rpm", 0, 2.0, 3_000).await.unwrap());
        assert!(store.refill_bucket("api-rpm", 1_000, 10.0, 3_000).await.unwrap());

        let stored = store.read_bucket("api-rpm").await.unwrap().unwrap();
        assert_eq!(stored.available_tokens, 5.0);
        assert_eq!(stored.last_refill_ms, 3_000);
        assert_eq!(stored.expires_at_ms, 63_000);
    }

    #[tokio::test]
    async fn test_expired_bucket_reads_as_absent_then_is_reclaimed() {
        let (store, clock) = store_at(1_000);
        store.create_bucket(bucket(5.0)).await.unwrap();
        assert_eq!(store.reclaim_idle(30_000).await.unwrap(), 0);

        clock.set(61_000);
        assert!(store.read_bucket("api-rpm").await.unwrap().is_none());
        assert_eq!(store.len().await, 1);

        assert_eq!(store.reclaim_idle(61_000).await.unwrap(), 1);
        assert_eq!(store.len().await, 0);
    }
}

//! Token-bucket rate limiting shared by every worker
//!
//! There is no coordinator: each call lazily refills the bucket from elapsed
//! time and then asks the store for a conditional decrement. The store checks
//! the balance at write time, so concurrent callers can never over-grant.

use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::core::bucket_store::BucketStore;
use crate::core::clock::Clock;
use crate::core::config::{bucket_defaults, BucketConfig};
use crate::core::errors::{Result, TranslationError};
use crate::core::models::RateLimitBucket;

/// Result of a single acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquisition {
    pub granted: bool,
    pub retry_after_ms: Option<u64>,
}

impl Acquisition {
    fn granted() -> Self {
        Self {
            granted: true,
            retry_after_ms: None,
        }
    }

    fn denied(retry_after_ms: u64) -> Self {
        Self {
            granted: false,
            retry_after_ms: Some(retry_after_ms),
        }
    }
}

/// Cost to charge against one bucket
#[derive(Debug, Clone, PartialEq)]
pub struct Permit {
    pub bucket_key: String,
    pub cost: f64,
}

impl Permit {
    pub fn new(bucket_key: impl Into<String>, cost: f64) -> Self {
        Self {
            bucket_key: bucket_key.into(),
            cost,
        }
    }
}

/// Inner retry budget used by a worker while waiting for permits
#[derive(Debug, Clone, Copy)]
pub struct AcquireRetryPolicy {
    pub max_attempts: u32,
    /// Upper bound on a single sleep between attempts
    pub max_wait: Duration,
}

/// Handle onto the shared buckets
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    defaults: Arc<Vec<BucketConfig>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("clock", &self.clock)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
        defaults: Vec<BucketConfig>,
    ) -> Self {
        Self {
            store,
            clock,
            defaults: Arc::new(defaults),
        }
    }

    /// Read the bucket, creating it with configured defaults on first use
    async fn load_bucket(&self, key: &str) -> Result<RateLimitBucket> {
        if let Some(bucket) = self.store.read_bucket(key).await? {
            return Ok(bucket);
        }

        let config =
            bucket_defaults(&self.defaults, key).ok_or_else(|| TranslationError::ConfigError {
                message: format!("no bucket defaults configured for {}", key),
            })?;

        let fresh = RateLimitBucket::full(
            key,
            config.capacity,
            config.refill_rate_per_second,
            config.ttl_secs * 1000,
            self.clock.now_millis(),
        );
        // Losing the creation race is fine: read back whichever row won
        self.store.create_bucket(fresh.clone()).await?;
        Ok(self.store.read_bucket(key).await?.unwrap_or(fresh))
    }

    /// Try to take `cost` tokens from `key` once
    pub async fn acquire(&self, key: &str, cost: f64) -> Result<Acquisition> {
        let bucket = self.load_bucket(key).await?;

        if cost > bucket.capacity {
            return Err(TranslationError::terminal(format!(
                "cost {} exceeds capacity {} of bucket {}",
                cost, bucket.capacity, key
            )));
        }

        let now = self.clock.now_millis();
        if now > bucket.last_refill_ms {
            let elapsed_secs = (now - bucket.last_refill_ms) as f64 / 1000.0;
            let added = elapsed_secs * bucket.refill_rate_per_second;
            let refilled = self
                .store
                .refill_bucket(key, bucket.last_refill_ms, added, now)
                .await?;
            if !refilled {
                // Another worker refilled first; its write already covers this interval
                debug!(bucket = key, "Refill lost the race");
            }
        }

        let outcome = self.store.try_decrement(key, cost).await?;
        if outcome.success {
            debug!(bucket = key, cost, remaining = outcome.new_available, "Permit granted");
            return Ok(Acquisition::granted());
        }

        let view = RateLimitBucket {
            available_tokens: outcome.new_available,
            ..bucket
        };
        let retry_after_ms = view.millis_until(cost).max(1);
        debug!(bucket = key, cost, retry_after_ms, "Permit denied");
        Ok(Acquisition::denied(retry_after_ms))
    }

    /// Take every permit, in order, stopping at the first denial.
    ///
    /// Permits granted before the denial stay consumed and decay through
    /// normal refill.
    pub async fn acquire_all(&self, permits: &[Permit]) -> Result<Acquisition> {
        for permit in permits {
            let acquisition = self.acquire(&permit.bucket_key, permit.cost).await?;
            if !acquisition.granted {
                return Ok(acquisition);
            }
        }
        Ok(Acquisition::granted())
    }

    /// Acquire all permits, sleeping with jitter between attempts.
    ///
    /// Permits already granted in an earlier attempt are not requested again.
    /// Fails with [`TranslationError::RateLimited`] once the budget is spent.
    pub async fn acquire_with_retry(
        &self,
        permits: &[Permit],
        policy: &AcquireRetryPolicy,
    ) -> Result<()> {
        let mut outstanding: Vec<&Permit> = permits.iter().collect();
        let mut last_retry_after = None;

        for attempt in 1..=policy.max_attempts {
            while let Some(permit) = outstanding.first() {
                let acquisition = self.acquire(&permit.bucket_key, permit.cost).await?;
                if !acquisition.granted {
                    last_retry_after = acquisition.retry_after_ms;
                    break;
                }
                outstanding.remove(0);
            }

            if outstanding.is_empty() {
                return Ok(());
            }
            if attempt == policy.max_attempts {
                break;
            }

            let wait = jittered(last_retry_after.unwrap_or(1), policy.max_wait);
            debug!(
                attempt,
                bucket = %outstanding[0].bucket_key,
                wait_ms = wait.as_millis() as u64,
                "Waiting for rate-limit permits"
            );
            sleep(wait).await;
        }

        let bucket = outstanding
            .first()
            .map(|p| p.bucket_key.clone())
            .unwrap_or_default();
        warn!(bucket = %bucket, attempts = policy.max_attempts, "Rate-limit budget exhausted");
        Err(TranslationError::RateLimited {
            message: format!("bucket {} denied after {} attempts", bucket, policy.max_attempts),
            retry_after_ms: last_retry_after,
        })
    }

    /// Drop buckets that have been idle past their TTL
    pub async fn reclaim_idle(&self) -> Result<usize> {
        let removed = self.store.reclaim_idle(self.clock.now_millis()).await?;
        if removed > 0 {
            debug!(removed, "Reclaimed idle buckets");
        }
        Ok(removed)
    }
}

/// Sleep somewhere in the upper half of the wait, capped at `max_wait`
fn jittered(retry_after_ms: u64, max_wait: Duration) -> Duration {
    let cap = (max_wait.as_millis() as u64).max(1);
    let wait = retry_after_ms.clamp(1, cap);
    let ms = rand::thread_rng().gen_range(wait.div_ceil(2)..=wait);
    Duration::from_millis(ms)
}

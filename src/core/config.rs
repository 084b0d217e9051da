//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Defaults for a lazily created rate-limit bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub key: String,
    pub capacity: f64,
    pub refill_rate_per_second: f64,
    pub ttl_secs: u64,
}

/// Bucket charged one permit per API request
pub const REQUEST_BUCKET: &str = "api-rpm";

/// Bucket charged the estimated token cost of each request
pub const TOKEN_BUCKET: &str = "api-tpm";

/// Bucket defaults for `key`, falling back to the request bucket
pub fn bucket_defaults<'a>(buckets: &'a [BucketConfig], key: &str) -> Option<&'a BucketConfig> {
    buckets
        .iter()
        .find(|b| b.key == key)
        .or_else(|| buckets.iter().find(|b| b.key == REQUEST_BUCKET))
}

/// Default bucket configuration: (key, capacity, refill per minute)
const DEFAULT_BUCKETS: &[(&str, f64, f64)] = &[
    (REQUEST_BUCKET, 500.0, 500.0),
    (TOKEN_BUCKET, 200_000.0, 200_000.0),
];

const DEFAULT_BUCKET_TTL_SECS: u64 = 3600;

/// Configuration for the translation workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorConfig {
    pub api_key: String,
    pub api_endpoint: String,
    pub model: String,
    pub timeout_ms: u64,
    /// Upper bound on chunk tasks in flight per job
    pub max_concurrent: usize,
    pub context_chunk_count: usize,
    pub max_context_tokens: u32,
    /// Attempts per chunk at the orchestrator layer
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub backoff_factor: f64,
    /// Wall-clock budget of one workflow run
    pub job_timeout_ms: u64,
    pub chunk_wait_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Attempts at acquiring permits inside one worker run
    pub rate_limit_attempts: u32,
    pub rate_limit_max_wait_ms: u64,
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
    pub buckets: Vec<BucketConfig>,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("TRANSLATION_API_KEY").unwrap_or_default(),
            api_endpoint: std::env::var("TRANSLATION_API_ENDPOINT")
                .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string()),
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 120_000,
            max_concurrent: 10,
            context_chunk_count: 2,
            max_context_tokens: 8000,
            max_attempts: 3,
            retry_delay_ms: 2000,
            backoff_factor: 2.0,
            job_timeout_ms: 6 * 60 * 60 * 1000,
            chunk_wait_timeout_secs: 300,
            poll_interval_ms: 1000,
            rate_limit_attempts: 5,
            rate_limit_max_wait_ms: 15_000,
            input_price_per_1k: 0.000_15,
            output_price_per_1k: 0.000_6,
            buckets: vec![],
        }
    }
}

/// Read and parse an environment variable, falling back to `default`
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

impl TranslatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            api_key: defaults.api_key,
            api_endpoint: defaults.api_endpoint,
            model: std::env::var("TRANSLATION_MODEL").unwrap_or(defaults.model),
            timeout_ms: env_or("REQUEST_TIMEOUT_MS", defaults.timeout_ms)?,
            max_concurrent: env_or("MAX_CONCURRENT", defaults.max_concurrent)?,
            context_chunk_count: env_or("CONTEXT_CHUNK_COUNT", defaults.context_chunk_count)?,
            max_context_tokens: env_or("MAX_CONTEXT_TOKENS", defaults.max_context_tokens)?,
            max_attempts: env_or("MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_delay_ms: env_or("RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            backoff_factor: env_or("BACKOFF_FACTOR", defaults.backoff_factor)?,
            job_timeout_ms: env_or("JOB_TIMEOUT_MS", defaults.job_timeout_ms)?,
            chunk_wait_timeout_secs: env_or(
                "CHUNK_WAIT_TIMEOUT_SECS",
                defaults.chunk_wait_timeout_secs,
            )?,
            poll_interval_ms: env_or("POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            rate_limit_attempts: env_or("RATE_LIMIT_ATTEMPTS", defaults.rate_limit_attempts)?,
            rate_limit_max_wait_ms: env_or(
                "RATE_LIMIT_MAX_WAIT_MS",
                defaults.rate_limit_max_wait_ms,
            )?,
            input_price_per_1k: env_or("INPUT_PRICE_PER_1K", defaults.input_price_per_1k)?,
            output_price_per_1k: env_or("OUTPUT_PRICE_PER_1K", defaults.output_price_per_1k)?,
            buckets: vec![],
        })
    }

    /// Load configuration with default buckets
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::from_env()?;
        config.fill_default_buckets();
        Ok(config)
    }

    /// Add the default bucket definitions when none are configured
    pub fn fill_default_buckets(&mut self) {
        if !self.buckets.is_empty() {
            return;
        }

        self.buckets = DEFAULT_BUCKETS
            .iter()
            .map(|(key, capacity, per_minute)| BucketConfig {
                key: key.to_string(),
                capacity: *capacity,
                refill_rate_per_second: per_minute / 60.0,
                ttl_secs: DEFAULT_BUCKET_TTL_SECS,
            })
            .collect();

        info!("Loaded {} default rate-limit buckets", self.buckets.len());
    }

    /// Load from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)?;
        config.fill_default_buckets();
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_endpoint.is_empty() {
            return Err(anyhow::anyhow!("API endpoint is required"));
        }

        if self.api_key.is_empty() {
            warn!("No API key configured; requests will be sent unauthenticated");
        }

        if self.max_concurrent == 0 {
            return Err(anyhow::anyhow!("max_concurrent must be greater than 0"));
        }

        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("max_attempts must be greater than 0"));
        }

        if self.rate_limit_attempts == 0 {
            return Err(anyhow::anyhow!("rate_limit_attempts must be greater than 0"));
        }

        if self.backoff_factor < 1.0 {
            return Err(anyhow::anyhow!("backoff_factor must be at least 1.0"));
        }

        for bucket in &self.buckets {
            if bucket.capacity <= 0.0 || bucket.refill_rate_per_second <= 0.0 {
                return Err(anyhow::anyhow!(
                    "bucket {} needs a positive capacity and refill rate",
                    bucket.key
                ));
            }
        }

        Ok(())
    }

    /// Outer backoff before attempt `attempt` (1-based; the first attempt waits 0)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.backoff_factor.powi(attempt as i32 - 2);
        Duration::from_millis((self.retry_delay_ms as f64 * factor) as u64)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Estimated spend for a call, in the configured currency
    pub fn cost_of(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_price_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_price_per_1k
    }
}

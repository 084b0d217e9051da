//! Translate-chunk worker: one stateless execution per chunk

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::client::TranslationApi;
use crate::core::config::{TranslatorConfig, REQUEST_BUCKET, TOKEN_BUCKET};
use crate::core::context::{assemble_context, DegradedReason, TranslationContext};
use crate::core::errors::{ErrorKind, Result, TranslationError};
use crate::core::models::{
    estimate_tokens, Chunk, ChunkStatus, CounterDelta, TranslatedChunk, TranslationRequest,
};
use crate::core::rate_limiter::{AcquireRetryPolicy, Permit, RateLimiter};
use crate::core::store::{ChunkStore, JobStore};

/// Input of a single worker run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTask {
    pub job_id: String,
    pub chunk_index: u32,
    pub target_language: String,
    pub tone: String,
    pub context_chunk_count: usize,
}

/// What a worker run did
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Translated {
        input_tokens: u32,
        output_tokens: u32,
        context_chunks: Vec<u32>,
    },
    /// The chunk was TRANSLATED before, or by a racing run; only a count
    /// still owed to the job is settled
    AlreadyTranslated,
}

/// Runs the translate-chunk steps against shared stores.
///
/// Holds no per-job state, so any number of workers may run side by side in
/// one process or across machines.
#[derive(Clone)]
pub struct TranslateChunkWorker {
    jobs: Arc<dyn JobStore>,
    chunks: Arc<dyn ChunkStore>,
    api: Arc<dyn TranslationApi>,
    limiter: RateLimiter,
    config: Arc<TranslatorConfig>,
}

impl std::fmt::Debug for TranslateChunkWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslateChunkWorker")
            .field("limiter", &self.limiter)
            .finish()
    }
}

impl TranslateChunkWorker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        chunks: Arc<dyn ChunkStore>,
        api: Arc<dyn TranslationApi>,
        limiter: RateLimiter,
        config: Arc<TranslatorConfig>,
    ) -> Self {
        Self {
            jobs,
            chunks,
            api,
            limiter,
            config,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Translate one chunk end to end
    pub async fn run(&self, task: &ChunkTask) -> Result<ChunkOutcome> {
        let chunk = self
            .chunks
            .get_chunk(&task.job_id, task.chunk_index)
            .await?
            .ok_or_else(|| TranslationError::ChunkNotFound {
                job_id: task.job_id.clone(),
                chunk_index: task.chunk_index,
            })?;

        if chunk.status == ChunkStatus::Translated {
            debug!(job_id = %task.job_id, chunk_index = task.chunk_index, "Chunk already translated");
            self.count_stored(task, &chunk).await?;
            return Ok(ChunkOutcome::AlreadyTranslated);
        }

        let context = self.build_context(task, &chunk).await;

        let permits = [
            Permit::new(REQUEST_BUCKET, 1.0),
            Permit::new(TOKEN_BUCKET, context.total_tokens as f64),
        ];
        let policy = AcquireRetryPolicy {
            max_attempts: self.config.rate_limit_attempts,
            max_wait: std::time::Duration::from_millis(self.config.rate_limit_max_wait_ms),
        };
        self.limiter.acquire_with_retry(&permits, &policy).await?;

        let mut request = TranslationRequest::new(chunk.source_text.clone(), task.target_language.clone())
            .with_tone(task.tone.clone());
        if let Some(text) = context.text() {
            request = request.with_context(text);
        }
        let result = self.api.translate(&request).await?;

        let token_count = if result.output_tokens > 0 {
            result.output_tokens
        } else {
            estimate_tokens(&result.translated_text)
        };
        let usage = CounterDelta::for_chunk(
            task.chunk_index,
            result.total_tokens(),
            self.config.cost_of(result.input_tokens, result.output_tokens),
        );
        let written = self
            .chunks
            .put_translated_chunk(
                &task.job_id,
                task.chunk_index,
                &result.translated_text,
                token_count,
                usage,
            )
            .await?;
        if !written {
            debug!(job_id = %task.job_id, chunk_index = task.chunk_index, "Lost race to a duplicate run");
            if let Some(stored) = self.chunks.get_chunk(&task.job_id, task.chunk_index).await? {
                self.count_stored(task, &stored).await?;
            }
            return Ok(ChunkOutcome::AlreadyTranslated);
        }

        // Keyed by chunk index: a retry after a failure here counts the chunk exactly once
        let job = self.jobs.increment_job_counters(&task.job_id, usage).await?;

        info!(
            job_id = %task.job_id,
            chunk_index = task.chunk_index,
            tokens = result.total_tokens(),
            progress = %format!("{}/{}", job.chunks_translated, job.total_chunks),
            "Chunk translated"
        );

        Ok(ChunkOutcome::Translated {
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            context_chunks: context.indices(),
        })
    }

    /// Apply the increment a stored translation owes; a no-op once counted
    async fn count_stored(&self, task: &ChunkTask, chunk: &Chunk) -> Result<()> {
        let usage = chunk.usage.unwrap_or_default();
        let delta = CounterDelta {
            chunk_index: Some(task.chunk_index),
            chunks_translated: 1,
            ..usage
        };
        self.jobs.increment_job_counters(&task.job_id, delta).await?;
        Ok(())
    }

    /// Gather preceding translations and pick the window. Never fails: any
    /// trouble only shrinks the context.
    async fn build_context(&self, task: &ChunkTask, chunk: &Chunk) -> TranslationContext {
        let lowest = task
            .chunk_index
            .saturating_sub(task.context_chunk_count as u32);

        let mut fetched: HashMap<u32, TranslatedChunk> = HashMap::new();
        for index in (lowest..task.chunk_index).rev() {
            match self.chunks.get_translated_chunk(&task.job_id, index).await {
                Ok(Some(translated)) => {
                    fetched.insert(index, translated);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        job_id = %task.job_id,
                        chunk_index = task.chunk_index,
                        kind = %ErrorKind::ContextDegraded,
                        "Context lookup failed, translating without context: {}",
                        e
                    );
                    return TranslationContext {
                        chunks: vec![],
                        total_tokens: chunk.token_count,
                        degraded: Some(DegradedReason::Unavailable),
                    };
                }
            }
        }

        let context = assemble_context(
            task.chunk_index,
            chunk.token_count,
            self.config.max_context_tokens,
            task.context_chunk_count,
            |index| fetched.remove(&index),
        );

        if let Some(reason) = context.degraded {
            warn!(
                job_id = %task.job_id,
                chunk_index = task.chunk_index,
                kind = %ErrorKind::ContextDegraded,
                kept = context.chunks.len(),
                "Context reduced: {}",
                reason
            );
        }
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bucket_store::InMemoryBucketStore;
    use crate::core::clock::ManualClock;
    use crate::core::config::BucketConfig;
    use crate::core::models::{JobStatus, TranslationJob};
    use crate::core::store::InMemoryStore;
    use crate::core::testing::{FlakyStore, ScriptedApi};
    use tokio_test::assert_err;

    struct Fixture {
        store: InMemoryStore,
        flaky: Arc<FlakyStore>,
        api: Arc<ScriptedApi>,
        worker: TranslateChunkWorker,
    }

    async fn fixture(total: u32, request_capacity: f64) -> Fixture {
        let store = InMemoryStore::new();
        store
            .create_job(
                TranslationJob::new("job-1", "user-1", "fr", "formal", total)
                    .with_status(JobStatus::InProgress),
            )
            .await
            .unwrap();
        store
            .put_chunks(
                (0..total)
                    .map(|i| Chunk::new("job-1", i, format!("source {}", i), 100))
                    .collect(),
            )
            .await
            .unwrap();

        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let limiter = RateLimiter::new(
            Arc::new(InMemoryBucketStore::with_clock(clock.clone())),
            clock,
            vec![
                BucketConfig {
                    key: REQUEST_BUCKET.to_string(),
                    capacity: request_capacity,
                    refill_rate_per_second: 0.001,
                    ttl_secs: 3600,
                },
                BucketConfig {
                    key: TOKEN_BUCKET.to_string(),
                    capacity: 100_000.0,
                    refill_rate_per_second: 1000.0,
                    ttl_secs: 3600,
                },
            ],
        );

        let config = TranslatorConfig {
            max_context_tokens: 1000,
            rate_limit_attempts: 2,
            rate_limit_max_wait_ms: 1,
            ..Default::default()
        };
        let api = Arc::new(ScriptedApi::new());
        let flaky = Arc::new(FlakyStore::new(store.clone()));
        let worker = TranslateChunkWorker::new(
            flaky.clone(),
            flaky.clone(),
            api.clone(),
            limiter,
            Arc::new(config),
        );
        Fixture {
            store,
            flaky,
            api,
            worker,
        }
    }

    fn task(chunk_index: u32) -> ChunkTask {
        ChunkTask {
            job_id: "job-1".to_string(),
            chunk_index,
            target_language: "fr".to_string(),
            tone: "formal".to_string(),
            context_chunk_count: 2,
        }
    }

    #[tokio::test]
    async fn test_translates_and_counts_once() {
        let f = fixture(3, 100.0).await;

        let outcome = f.worker.run(&task(0)).await.unwrap();
        assert!(matches!(outcome, ChunkOutcome::Translated { .. }));

        let job = f.store.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.chunks_translated, 1);
        assert!(job.tokens_used > 0);
        assert!(job.estimated_cost > 0.0);

        let translated = f.store.get_translated_chunk("job-1", 0).await.unwrap().unwrap();
        assert_eq!(translated.translated_text, "[fr] source 0");
    }

    #[tokio::test]
    async fn test_rerun_of_translated_chunk_is_noop() {
        let f = fixture(2, 100.0).await;
        f.worker.run(&task(0)).await.unwrap();

        let again = f.worker.run(&task(0)).await.unwrap();
        assert_eq!(again, ChunkOutcome::AlreadyTranslated);
        assert_eq!(f.api.calls().len(), 1);
        assert_eq!(
            f.store.get_job("job-1").await.unwrap().unwrap().chunks_translated,
            1
        );
    }

    #[tokio::test]
    async fn test_context_uses_preceding_translations() {
        let f = fixture(4, 100.0).await;
        for i in 0..3 {
            f.worker.run(&task(i)).await.unwrap();
        }

        let outcome = f.worker.run(&task(3)).await.unwrap();
        match outcome {
            ChunkOutcome::Translated { context_chunks, .. } => assert_eq!(context_chunks, vec![1, 2]),
            other => panic!("unexpected outcome {:?}", other),
        }

        let last = f.api.calls().pop().unwrap();
        assert_eq!(
            last.context_text.as_deref(),
            Some("[fr] source 1\n\n[fr] source 2")
        );
    }

    #[tokio::test]
    async fn test_missing_predecessor_degrades_context() {
        let f = fixture(3, 100.0).await;

        let outcome = f.worker.run(&task(2)).await.unwrap();
        match outcome {
            ChunkOutcome::Translated { context_chunks, .. } => assert!(context_chunks.is_empty()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(f.api.calls()[0].context_text, None);
    }

    #[tokio::test]
    async fn test_unreadable_context_translates_without_it() {
        let f = fixture(3, 100.0).await;
        f.worker.run(&task(0)).await.unwrap();
        f.worker.run(&task(1)).await.unwrap();

        f.flaky.fail_context_reads(1);
        let outcome = f.worker.run(&task(2)).await.unwrap();
        match outcome {
            ChunkOutcome::Translated { context_chunks, .. } => assert!(context_chunks.is_empty()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(f.api.calls().pop().unwrap().context_text, None);
        assert_eq!(
            f.store.get_job("job-1").await.unwrap().unwrap().chunks_translated,
            3
        );
    }

    #[tokio::test]
    async fn test_failed_count_is_settled_on_rerun() {
        let f = fixture(2, 100.0).await;
        f.flaky.fail_increments(1);

        let err = assert_err!(f.worker.run(&task(0)).await);
        assert_eq!(err.kind(), ErrorKind::Transient);
        // The translation landed but the job does not know yet
        assert!(f.store.get_translated_chunk("job-1", 0).await.unwrap().is_some());
        assert_eq!(
            f.store.get_job("job-1").await.unwrap().unwrap().chunks_translated,
            0
        );

        let again = f.worker.run(&task(0)).await.unwrap();
        assert_eq!(again, ChunkOutcome::AlreadyTranslated);
        let job = f.store.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.chunks_translated, 1);
        let owed = f.store.get_chunk("job-1", 0).await.unwrap().unwrap().usage.unwrap();
        assert_eq!(job.tokens_used, owed.tokens_used);

        f.worker.run(&task(0)).await.unwrap();
        assert_eq!(
            f.store.get_job("job-1").await.unwrap().unwrap().chunks_translated,
            1
        );
        assert_eq!(f.api.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_api_failure_leaves_counters_untouched() {
        let f = fixture(1, 100.0).await;
        f.api.fail_next("source 0", ErrorKind::Transient);

        let err = assert_err!(f.worker.run(&task(0)).await);
        assert_eq!(err.kind(), ErrorKind::Transient);

        let job = f.store.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.chunks_translated, 0);
        assert!(f.store.get_translated_chunk("job-1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exhausted_permits_surface_rate_limited() {
        let f = fixture(2, 1.0).await;
        f.worker.run(&task(0)).await.unwrap();

        let err = assert_err!(f.worker.run(&task(1)).await);
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(f.api.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_terminal() {
        let f = fixture(1, 100.0).await;
        let err = assert_err!(f.worker.run(&task(7)).await);
        assert_eq!(err.kind(), ErrorKind::Terminal);
    }
}

//! Scripted translation API and failure-injecting store for tests

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::core::client::TranslationApi;
use crate::core::errors::{ErrorKind, Result, TranslationError};
use crate::core::models::{
    estimate_tokens, Chunk, ChunkStatus, CounterDelta, JobStatus, TranslatedChunk, TranslationJob,
    TranslationRequest, TranslationResult,
};
use crate::core::store::{ChunkStore, InMemoryStore, JobStore};

/// Echoes `[target] text` unless a failure was scripted for that text
#[derive(Debug, Default)]
pub struct ScriptedApi {
    failures: Mutex<HashMap<String, VecDeque<ErrorKind>>>,
    calls: Mutex<Vec<TranslationRequest>>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Fail the next call for `chunk_text` with an error of `kind`
    pub fn fail_next(&self, chunk_text: &str, kind: ErrorKind) {
        self.failures
            .lock()
            .unwrap()
            .entry(chunk_text.to_string())
            .or_default()
            .push_back(kind);
    }

    pub fn calls(&self) -> Vec<TranslationRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Source texts in call order
    pub fn called_texts(&self) -> Vec<String> {
        self.calls().into_iter().map(|r| r.chunk_text).collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

fn error_of(kind: ErrorKind) -> TranslationError {
    match kind {
        ErrorKind::RateLimited => TranslationError::RateLimited {
            message: "scripted 429".to_string(),
            retry_after_ms: Some(1),
        },
        ErrorKind::Transient => TranslationError::transient("scripted 503"),
        _ => TranslationError::terminal("scripted 400"),
    }
}

#[async_trait]
impl TranslationApi for ScriptedApi {
    async fn translate(&self, request: &TranslationRequest) -> Result<TranslationResult> {
        self.calls.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&request.chunk_text)
            .and_then(|queue| queue.pop_front());
        if let Some(kind) = scripted {
            return Err(error_of(kind));
        }

        let translated_text = format!("[{}] {}", request.target_lang, request.chunk_text);
        Ok(TranslationResult {
            input_tokens: estimate_tokens(&request.chunk_text)
                + request.context_text.as_deref().map(estimate_tokens).unwrap_or(0),
            output_tokens: estimate_tokens(&translated_text),
            translated_text,
            model_used: "scripted".to_string(),
            request_id: None,
        })
    }
}

/// Wraps an `InMemoryStore` and fails selected calls with a transient error
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    failing_increments: AtomicUsize,
    failing_context_reads: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Fail the next `n` counter increments
    pub fn fail_increments(&self, n: usize) {
        self.failing_increments.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` translated-chunk lookups
    pub fn fail_context_reads(&self, n: usize) {
        self.failing_context_reads.store(n, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create_job(&self, job: TranslationJob) -> Result<()> {
        self.inner.create_job(job).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<TranslationJob>> {
        self.inner.get_job(job_id).await
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<TranslationJob> {
        self.inner.update_job_status(job_id, status).await
    }

    async fn increment_job_counters(
        &self,
        job_id: &str,
        delta: CounterDelta,
    ) -> Result<TranslationJob> {
        if Self::take(&self.failing_increments) {
            return Err(TranslationError::transient("counter write timed out"));
        }
        self.inner.increment_job_counters(job_id, delta).await
    }

    async fn record_job_error(
        &self,
        job_id: &str,
        chunk_index: Option<u32>,
        error: &str,
    ) -> Result<()> {
        self.inner.record_job_error(job_id, chunk_index, error).await
    }

    async fn clear_job_error(&self, job_id: &str) -> Result<()> {
        self.inner.clear_job_error(job_id).await
    }

    async fn list_jobs(&self) -> Result<Vec<TranslationJob>> {
        self.inner.list_jobs().await
    }
}

#[async_trait]
impl ChunkStore for FlakyStore {
    async fn put_chunks(&self, chunks: Vec<Chunk>) -> Result<()> {
        self.inner.put_chunks(chunks).await
    }

    async fn get_chunk(&self, job_id: &str, chunk_index: u32) -> Result<Option<Chunk>> {
        self.inner.get_chunk(job_id, chunk_index).await
    }

    async fn get_translated_chunk(
        &self,
        job_id: &str,
        chunk_index: u32,
    ) -> Result<Option<TranslatedChunk>> {
        if Self::take(&self.failing_context_reads) {
            return Err(TranslationError::transient("chunk read timed out"));
        }
        self.inner.get_translated_chunk(job_id, chunk_index).await
    }

    async fn put_translated_chunk(
        &self,
        job_id: &str,
        chunk_index: u32,
        translated_text: &str,
        token_count: u32,
        usage: CounterDelta,
    ) -> Result<bool> {
        self.inner
            .put_translated_chunk(job_id, chunk_index, translated_text, token_count, usage)
            .await
    }

    async fn mark_chunk_failed(&self, job_id: &str, chunk_index: u32) -> Result<()> {
        self.inner.mark_chunk_failed(job_id, chunk_index).await
    }

    async fn list_chunk_statuses(&self, job_id: &str) -> Result<Vec<(u32, ChunkStatus)>> {
        self.inner.list_chunk_statuses(job_id).await
    }
}

//! Job and chunk persistence
//!
//! Workers on different machines update the same job concurrently, so the
//! store exposes commutative increments and conditional writes instead of
//! read-modify-write of whole records.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::core::errors::{Result, TranslationError};
use crate::core::models::{
    Chunk, ChunkStatus, CounterDelta, JobStatus, TranslatedChunk, TranslationJob,
};

/// Job records
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job produced by the chunking collaborator
    async fn create_job(&self, job: TranslationJob) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<TranslationJob>>;

    /// Move the job along its lifecycle; rejects anything else
    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<TranslationJob>;

    /// Commutative counter increment; refuses to exceed `total_chunks`.
    /// A delta keyed by chunk index is applied at most once, so repeating it
    /// after a failed attempt is safe.
    async fn increment_job_counters(
        &self,
        job_id: &str,
        delta: CounterDelta,
    ) -> Result<TranslationJob>;

    /// Record the failing chunk (if any) and error text for diagnostics
    async fn record_job_error(
        &self,
        job_id: &str,
        chunk_index: Option<u32>,
        error: &str,
    ) -> Result<()>;

    /// Forget the previous failure before an explicit retry
    async fn clear_job_error(&self, job_id: &str) -> Result<()>;

    async fn list_jobs(&self) -> Result<Vec<TranslationJob>>;
}

/// Chunk rows
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert the chunks of a job
    async fn put_chunks(&self, chunks: Vec<Chunk>) -> Result<()>;

    async fn get_chunk(&self, job_id: &str, chunk_index: u32) -> Result<Option<Chunk>>;

    /// Translated text, `None` unless the chunk is TRANSLATED
    async fn get_translated_chunk(
        &self,
        job_id: &str,
        chunk_index: u32,
    ) -> Result<Option<TranslatedChunk>>;

    /// Store a translation and the counter increment it owes, unless the
    /// chunk is already TRANSLATED. Returns whether this call performed the write.
    async fn put_translated_chunk(
        &self,
        job_id: &str,
        chunk_index: u32,
        translated_text: &str,
        token_count: u32,
        usage: CounterDelta,
    ) -> Result<bool>;

    /// Mark a chunk FAILED; a TRANSLATED chunk is left alone
    async fn mark_chunk_failed(&self, job_id: &str, chunk_index: u32) -> Result<()>;

    /// Statuses ordered by chunk index
    async fn list_chunk_statuses(&self, job_id: &str) -> Result<Vec<(u32, ChunkStatus)>>;
}

/// Everything the in-memory store holds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub jobs: HashMap<String, TranslationJob>,
    /// job id -> chunk index -> chunk
    pub chunks: HashMap<String, BTreeMap<u32, Chunk>>,
}

/// Single-process job and chunk store
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreSnapshot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.state.read().await.clone()
    }

    /// All chunks of a job, ordered by index
    pub async fn chunks_of(&self, job_id: &str) -> Vec<Chunk> {
        let state = self.state.read().await;
        state
            .chunks
            .get(job_id)
            .map(|chunks| chunks.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn job_not_found(job_id: &str) -> TranslationError {
    TranslationError::JobNotFound {
        job_id: job_id.to_string(),
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_job(&self, job: TranslationJob) -> Result<()> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.job_id) {
            return Err(TranslationError::terminal(format!(
                "job {} already exists",
                job.job_id
            )));
        }
        debug!(job_id = %job.job_id, total_chunks = job.total_chunks, "Created job");
        state.jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<TranslationJob>> {
        Ok(self.state.read().await.jobs.get(job_id).cloned())
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<TranslationJob> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| job_not_found(job_id))?;

        if !job.status.can_transition_to(status) {
            return Err(TranslationError::InvalidTransition {
                from: job.status,
                to: status,
            });
        }

        let now = Utc::now();
        if job.status != status {
            info!(job_id, from = %job.status, to = %status, "Job status changed");
        }
        if status == JobStatus::InProgress && job.status != JobStatus::InProgress {
            job.started_at = Some(now);
        }
        job.status = status;
        job.updated_at = now;
        if status == JobStatus::Completed {
            job.completed_at = Some(now);
        }
        Ok(job.clone())
    }

    async fn increment_job_counters(
        &self,
        job_id: &str,
        delta: CounterDelta,
    ) -> Result<TranslationJob> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| job_not_found(job_id))?;

        if let Some(index) = delta.chunk_index {
            if job.counted_chunks.contains(&index) {
                debug!(job_id, chunk_index = index, "Chunk already counted");
                return Ok(job.clone());
            }
        }

        let translated = job.chunks_translated + delta.chunks_translated;
        if translated > job.total_chunks {
            return Err(TranslationError::CounterRejected {
                job_id: job_id.to_string(),
                message: format!(
                    "chunks_translated would reach {} of {}",
                    translated, job.total_chunks
                ),
            });
        }

        if let Some(index) = delta.chunk_index {
            job.counted_chunks.insert(index);
        }
        job.chunks_translated = translated;
        job.tokens_used += delta.tokens_used;
        job.estimated_cost += delta.estimated_cost;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn record_job_error(
        &self,
        job_id: &str,
        chunk_index: Option<u32>,
        error: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| job_not_found(job_id))?;

        job.failed_chunk_index = chunk_index;
        job.last_error = Some(error.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn clear_job_error(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| job_not_found(job_id))?;

        job.failed_chunk_index = None;
        job.last_error = None;
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<TranslationJob>> {
        let state = self.state.read().await;
        let mut jobs: Vec<TranslationJob> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn put_chunks(&self, chunks: Vec<Chunk>) -> Result<()> {
        let mut state = self.state.write().await;
        for chunk in chunks {
            state
                .chunks
                .entry(chunk.job_id.clone())
                .or_default()
                .insert(chunk.chunk_index, chunk);
        }
        Ok(())
    }

    async fn get_chunk(&self, job_id: &str, chunk_index: u32) -> Result<Option<Chunk>> {
        let state = self.state.read().await;
        Ok(state
            .chunks
            .get(job_id)
            .and_then(|chunks| chunks.get(&chunk_index))
            .cloned())
    }

    async fn get_translated_chunk(
        &self,
        job_id: &str,
        chunk_index: u32,
    ) -> Result<Option<TranslatedChunk>> {
        let state = self.state.read().await;
        let Some(chunk) = state
            .chunks
            .get(job_id)
            .and_then(|chunks| chunks.get(&chunk_index))
        else {
            return Ok(None);
        };

        if chunk.status != ChunkStatus::Translated {
            return Ok(None);
        }
        Ok(chunk.translated_text.as_ref().map(|text| TranslatedChunk {
            chunk_index,
            translated_text: text.clone(),
            token_count: chunk.translated_token_count.unwrap_or(chunk.token_count),
        }))
    }

    async fn put_translated_chunk(
        &self,
        job_id: &str,
        chunk_index: u32,
        translated_text: &str,
        token_count: u32,
        usage: CounterDelta,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let chunk = state
            .chunks
            .get_mut(job_id)
            .and_then(|chunks| chunks.get_mut(&chunk_index))
            .ok_or_else(|| TranslationError::ChunkNotFound {
                job_id: job_id.to_string(),
                chunk_index,
            })?;

        if chunk.status == ChunkStatus::Translated {
            return Ok(false);
        }
        chunk.translated_text = Some(translated_text.to_string());
        chunk.translated_token_count = Some(token_count);
        chunk.usage = Some(usage);
        chunk.status = ChunkStatus::Translated;
        Ok(true)
    }

    async fn mark_chunk_failed(&self, job_id: &str, chunk_index: u32) -> Result<()> {
        let mut state = self.state.write().await;
        let chunk = state
            .chunks
            .get_mut(job_id)
            .and_then(|chunks| chunks.get_mut(&chunk_index))
            .ok_or_else(|| TranslationError::ChunkNotFound {
                job_id: job_id.to_string(),
                chunk_index,
            })?;

        if chunk.status != ChunkStatus::Translated {
            chunk.status = ChunkStatus::Failed;
        }
        Ok(())
    }

    async fn list_chunk_statuses(&self, job_id: &str) -> Result<Vec<(u32, ChunkStatus)>> {
        let state = self.state.read().await;
        Ok(state
            .chunks
            .get(job_id)
            .map(|chunks| chunks.values().map(|c| (c.chunk_index, c.status)).collect())
            .unwrap_or_default())
    }
}

/// In-memory store that rewrites a JSON snapshot after every mutation, so an
/// interrupted run can be resumed from the file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    inner: InMemoryStore,
    path: PathBuf,
    /// Serializes snapshot writes
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl JsonFileStore {
    /// Open `path`, starting empty when the file does not exist yet
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreSnapshot::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            inner: InMemoryStore::from_snapshot(snapshot),
            path,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.inner.snapshot().await;
        let content = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for JsonFileStore {
    async fn create_job(&self, job: TranslationJob) -> Result<()> {
        self.inner.create_job(job).await?;
        self.flush().await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<TranslationJob>> {
        self.inner.get_job(job_id).await
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<TranslationJob> {
        let job = self.inner.update_job_status(job_id, status).await?;
        self.flush().await?;
        Ok(job)
    }

    async fn increment_job_counters(
        &self,
        job_id: &str,
        delta: CounterDelta,
    ) -> Result<TranslationJob> {
        let job = self.inner.increment_job_counters(job_id, delta).await?;
        self.flush().await?;
        Ok(job)
    }

    async fn record_job_error(
        &self,
        job_id: &str,
        chunk_index: Option<u32>,
        error: &str,
    ) -> Result<()> {
        self.inner.record_job_error(job_id, chunk_index, error).await?;
        self.flush().await
    }

    async fn clear_job_error(&self, job_id: &str) -> Result<()> {
        self.inner.clear_job_error(job_id).await?;
        self.flush().await
    }

    async fn list_jobs(&self) -> Result<Vec<TranslationJob>> {
        self.inner.list_jobs().await
    }
}

#[async_trait]
impl ChunkStore for JsonFileStore {
    async fn put_chunks(&self, chunks: Vec<Chunk>) -> Result<()> {
        self.inner.put_chunks(chunks).await?;
        self.flush().await
    }

    async fn get_chunk(&self, job_id: &str, chunk_index: u32) -> Result<Option<Chunk>> {
        self.inner.get_chunk(job_id, chunk_index).await
    }

    async fn get_translated_chunk(
        &self,
        job_id: &str,
        chunk_index: u32,
    ) -> Result<Option<TranslatedChunk>> {
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
        let written = self
            .inner
            .put_translated_chunk(job_id, chunk_index, translated_text, token_count, usage)
            .await?;
        if written {
            self.flush().await?;
        }
        Ok(written)
    }

    async fn mark_chunk_failed(&self, job_id: &str, chunk_index: u32) -> Result<()> {
        self.inner.mark_chunk_failed(job_id, chunk_index).await?;
        self.flush().await
    }

    async fn list_chunk_statuses(&self, job_id: &str) -> Result<Vec<(u32, ChunkStatus)>> {
        self.inner.list_chunk_statuses(job_id).await
    }
}

//! Core data models for the translation workflow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Lifecycle status of a translation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Chunking,
    Chunked,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs are never re-entered implicitly
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Forward-only lifecycle. FAILED -> IN_PROGRESS is the explicit retry path.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Chunking)
                | (Chunking, Chunked)
                | (Chunked, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, InProgress)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Chunking => write!(f, "CHUNKING"),
            JobStatus::Chunked => write!(f, "CHUNKED"),
            JobStatus::InProgress => write!(f, "IN_PROGRESS"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// A document translation job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationJob {
    pub job_id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub target_language: String,
    pub tone: String,
    pub total_chunks: u32,
    pub chunks_translated: u32,
    pub failed_chunk_index: Option<u32>,
    pub last_error: Option<String>,
    pub tokens_used: u64,
    pub estimated_cost: f64,
    /// Chunks already added to `chunks_translated`
    #[serde(default)]
    pub counted_chunks: BTreeSet<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last entry into IN_PROGRESS from CHUNKED or FAILED; the job timeout runs from here
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TranslationJob {
    pub fn new(
        job_id: impl Into<String>,
        user_id: impl Into<String>,
        target_language: impl Into<String>,
        tone: impl Into<String>,
        total_chunks: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            status: JobStatus::Pending,
            target_language: target_language.into(),
            tone: tone.into(),
            total_chunks,
            chunks_translated: 0,
            failed_chunk_index: None,
            last_error: None,
            tokens_used: 0,
            estimated_cost: 0.0,
            counted_chunks: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    /// Fraction of chunks translated, 0.0..=1.0
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        self.chunks_translated as f64 / self.total_chunks as f64
    }
}

/// Per-chunk translation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    Pending,
    Translated,
    Failed,
}

/// One bounded segment of a source document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub job_id: String,
    pub chunk_index: u32,
    pub source_text: String,
    pub token_count: u32,
    pub translated_text: Option<String>,
    /// Tokens reported for the translated text
    pub translated_token_count: Option<u32>,
    /// Counter increment owed to the job for this translation
    #[serde(default)]
    pub usage: Option<CounterDelta>,
    pub status: ChunkStatus,
}

impl Chunk {
    pub fn new(
        job_id: impl Into<String>,
        chunk_index: u32,
        source_text: impl Into<String>,
        token_count: u32,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            chunk_index,
            source_text: source_text.into(),
            token_count,
            translated_text: None,
            translated_token_count: None,
            usage: None,
            status: ChunkStatus::Pending,
        }
    }
}

/// Translated text of a chunk as exposed to context assembly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedChunk {
    pub chunk_index: u32,
    pub translated_text: String,
    pub token_count: u32,
}

/// Commutative increments applied to a job's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterDelta {
    /// Chunk this increment pays for; a keyed delta is applied at most once
    pub chunk_index: Option<u32>,
    pub chunks_translated: u32,
    pub tokens_used: u64,
    pub estimated_cost: f64,
}

impl CounterDelta {
    /// One translated chunk with its token usage and cost
    pub fn for_chunk(chunk_index: u32, tokens_used: u64, estimated_cost: f64) -> Self {
        Self {
            chunk_index: Some(chunk_index),
            chunks_translated: 1,
            tokens_used,
            estimated_cost,
        }
    }
}

/// Shared token bucket row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub bucket_key: String,
    pub capacity: f64,
    pub available_tokens: f64,
    pub refill_rate_per_second: f64,
    pub last_refill_ms: u64,
    pub ttl_ms: u64,
    /// Idle buckets past this instant may be reclaimed
    pub expires_at_ms: u64,
}

impl RateLimitBucket {
    /// A full bucket as created on first use
    pub fn full(
        bucket_key: impl Into<String>,
        capacity: f64,
        refill_rate_per_second: f64,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Self {
        Self {
            bucket_key: bucket_key.into(),
            capacity,
            available_tokens: capacity,
            refill_rate_per_second,
            last_refill_ms: now_ms,
            ttl_ms,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        }
    }

    /// Milliseconds until `cost` tokens will be available again
    pub fn millis_until(&self, cost: f64) -> u64 {
        let missing = (cost - self.available_tokens).max(0.0);
        if missing == 0.0 {
            return 0;
        }
        ((missing / self.refill_rate_per_second) * 1000.0).ceil() as u64
    }
}

/// Request sent to the external translation API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub chunk_text: String,
    pub context_text: Option<String>,
    pub target_lang: String,
    pub tone: String,
}

impl TranslationRequest {
    pub fn new(chunk_text: impl Into<String>, target_lang: impl Into<String>) -> Self {
        Self {
            chunk_text: chunk_text.into(),
            context_text: None,
            target_lang: target_lang.into(),
            tone: "neutral".to_string(),
        }
    }

    pub fn with_tone(mut self, tone: impl Into<String>) -> Self {
        self.tone = tone.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context_text = Some(context.into());
        self
    }
}

/// Translation result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationResult {
    pub translated_text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model_used: String,
    pub request_id: Option<String>,
}

impl TranslationResult {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}

/// Rough token estimate used when the chunker did not supply a count
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() / 4).max(1) as u32
}

//! Custom error types for translation workflow operations

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::models::JobStatus;

/// Failure classes used to decide between retrying, failing and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Quota denied by the shared rate limiter or by the provider (HTTP 429)
    RateLimited,
    /// 5xx, network trouble or a malformed response; worth another attempt
    Transient,
    /// 4xx, validation or missing data; retrying cannot help
    Terminal,
    /// The job ran past its wall-clock budget
    Timeout,
    /// Context window was reduced or dropped; never fatal
    ContextDegraded,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::RateLimited => write!(f, "rate_limited"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Terminal => write!(f, "terminal"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::ContextDegraded => write!(f, "context_degraded"),
        }
    }
}

/// Translation-related errors
#[derive(Error, Debug)]
pub enum TranslationError {
    /// Permits could not be acquired, or the provider throttled the call
    #[error("Rate limited: {message} (retry after {retry_after_ms:?} ms)")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// Retryable failure
    #[error("Transient error: {message}")]
    Transient { message: String },

    /// Non-retryable failure
    #[error("Terminal error: {message}")]
    Terminal { message: String },

    /// Job exceeded its wall-clock budget
    #[error("Job timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    /// Job record does not exist
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// Chunk row does not exist
    #[error("Chunk not found: {job_id}#{chunk_index}")]
    ChunkNotFound { job_id: String, chunk_index: u32 },

    /// Status change outside the job lifecycle
    #[error("Invalid job status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Counter update would break the job's counter invariant
    #[error("Counter update rejected for job {job_id}: {message}")]
    CounterRejected { job_id: String, message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Reqwest error
    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Wrapper for anyhow errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl TranslationError {
    /// Classify the error for retry decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranslationError::RateLimited { .. } => ErrorKind::RateLimited,
            TranslationError::Transient { .. }
            | TranslationError::IoError(_)
            | TranslationError::HttpError(_) => ErrorKind::Transient,
            TranslationError::Timeout { .. } => ErrorKind::Timeout,
            TranslationError::Terminal { .. }
            | TranslationError::JobNotFound { .. }
            | TranslationError::ChunkNotFound { .. }
            | TranslationError::InvalidTransition { .. }
            | TranslationError::CounterRejected { .. }
            | TranslationError::ConfigError { .. }
            | TranslationError::JsonError(_)
            | TranslationError::InternalError(_) => ErrorKind::Terminal,
        }
    }

    /// Whether the orchestrator may schedule another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::RateLimited | ErrorKind::Transient)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        TranslationError::Transient {
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        TranslationError::Terminal {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for TranslationError {
    fn from(err: anyhow::Error) -> Self {
        TranslationError::InternalError(err.to_string())
    }
}

/// Result type for translation operations
pub type Result<T> = std::result::Result<T, TranslationError>;

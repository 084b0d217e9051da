//! Chunk Translator - resumable, rate-limited translation of chunked documents
//!
//! A document that has already been split into chunks is translated by a
//! workflow that bounds concurrency, feeds each chunk the translations of its
//! predecessors as context, and shares API rate limits through token buckets.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod core;
pub mod server;

// Re-export key types for convenience
pub use core::{
    client::{AsyncTranslator, TranslationApi},
    config::TranslatorConfig,
    context::{assemble_context, TranslationContext},
    errors::{ErrorKind, TranslationError},
    models::{JobStatus, TranslationJob, TranslationRequest, TranslationResult},
    orchestrator::{WorkflowOrchestrator, WorkflowOutcome, WorkflowState},
    rate_limiter::RateLimiter,
    worker::TranslateChunkWorker,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

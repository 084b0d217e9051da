//! CLI command definitions and handlers

use anyhow::Context;
use clap::Subcommand;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::core::bucket_store::InMemoryBucketStore;
use crate::core::client::{AsyncTranslator, TranslationApi};
use crate::core::clock::SystemClock;
use crate::core::config::TranslatorConfig;
use crate::core::models::{estimate_tokens, Chunk, ChunkStatus, JobStatus, TranslationJob};
use crate::core::orchestrator::{WorkflowOrchestrator, WorkflowOutcome, WorkflowState};
use crate::core::rate_limiter::RateLimiter;
use crate::core::store::{ChunkStore, JobStore, JsonFileStore};
use crate::core::worker::TranslateChunkWorker;

const DEFAULT_STATE_FILE: &str = "translation_state.json";

/// Commands for Chunk Translator
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Translate a pre-chunked document
    Translate {
        /// JSON array of chunks: strings or {"source_text", "token_count"} objects
        #[arg(short, long)]
        file: PathBuf,

        /// State file used to resume interrupted runs
        #[arg(long, default_value = DEFAULT_STATE_FILE)]
        state: PathBuf,

        /// Write the joined translation here once the job completes
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Target language (default: en)
        #[arg(short, long, default_value = "en")]
        target_lang: String,

        /// Tone of the translation
        #[arg(long, default_value = "neutral")]
        tone: String,

        /// Owner recorded on the job
        #[arg(long, default_value = "cli")]
        user_id: String,
    },

    /// Resume an interrupted job from its state file
    Resume {
        #[arg(long, default_value = DEFAULT_STATE_FILE)]
        state: PathBuf,

        /// Job to resume (default: the most recently updated unfinished job)
        #[arg(long)]
        job_id: Option<String>,

        /// Move a FAILED job back to IN_PROGRESS before resuming
        #[arg(long)]
        retry_failed: bool,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show job progress stored in a state file
    Status {
        #[arg(long, default_value = DEFAULT_STATE_FILE)]
        state: PathBuf,

        #[arg(long)]
        job_id: Option<String>,
    },

    /// Start HTTP API server
    Server {
        /// Bind address (default: 0.0.0.0)
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Listen port (default: 8000)
        #[arg(short, long, default_value_t = 8000)]
        port: u16,
    },
}

/// One entry of a chunks file
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChunkEntry {
    Text(String),
    Detailed {
        source_text: String,
        token_count: Option<u32>,
    },
}

/// Read a chunks file into (source text, token count) pairs
fn load_chunks(path: &Path) -> anyhow::Result<Vec<(String, u32)>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let entries: Vec<ChunkEntry> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of chunks", path.display()))?;

    if entries.is_empty() {
        anyhow::bail!("No chunks found in {}", path.display());
    }

    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            ChunkEntry::Text(text) => {
                let tokens = estimate_tokens(&text);
                (text, tokens)
            }
            ChunkEntry::Detailed {
                source_text,
                token_count,
            } => {
                let tokens = token_count.unwrap_or_else(|| estimate_tokens(&source_text));
                (source_text, tokens)
            }
        })
        .collect())
}

/// Persist a new CHUNKED job and its chunks
async fn register_job(
    store: &JsonFileStore,
    chunks: Vec<(String, u32)>,
    user_id: String,
    target_lang: String,
    tone: String,
) -> anyhow::Result<TranslationJob> {
    let job_id = uuid::Uuid::new_v4().to_string();
    let job = TranslationJob::new(
        job_id.clone(),
        user_id,
        target_lang,
        tone,
        chunks.len() as u32,
    )
    .with_status(JobStatus::Chunked);

    let chunks = chunks
        .into_iter()
        .enumerate()
        .map(|(index, (text, tokens))| Chunk::new(job_id.clone(), index as u32, text, tokens))
        .collect();
    store.put_chunks(chunks).await?;
    store.create_job(job.clone()).await?;

    Ok(job)
}

/// Wire the workflow over a state file
fn build_orchestrator(
    store: &JsonFileStore,
    api: Arc<dyn TranslationApi>,
    config: TranslatorConfig,
) -> WorkflowOrchestrator {
    let config = Arc::new(config);
    let clock = Arc::new(SystemClock);
    let limiter = RateLimiter::new(
        Arc::new(InMemoryBucketStore::with_clock(clock.clone())),
        clock,
        config.buckets.clone(),
    );
    let worker = TranslateChunkWorker::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        api,
        limiter,
        config.clone(),
    );
    WorkflowOrchestrator::new(Arc::new(store.clone()), Arc::new(store.clone()), worker, config)
}

fn live_orchestrator(store: &JsonFileStore) -> anyhow::Result<WorkflowOrchestrator> {
    let config = TranslatorConfig::load()?;
    let api = Arc::new(AsyncTranslator::new(config.clone())?);
    Ok(build_orchestrator(store, api, config))
}

/// Run the workflow while a progress bar polls the store
async fn run_with_progress(
    orchestrator: WorkflowOrchestrator,
    store: &JsonFileStore,
    job: &TranslationJob,
    retry_failed: bool,
) -> anyhow::Result<WorkflowOutcome> {
    let pb = ProgressBar::new(job.total_chunks as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("=>-"),
    );
    pb.set_position(job.chunks_translated as u64);
    pb.set_message(format!("Translating to {}", job.target_language));

    let job_id = job.job_id.clone();
    let handle = tokio::spawn(async move {
        if retry_failed {
            orchestrator.retry_failed(&job_id).await
        } else {
            orchestrator.start_workflow(&job_id).await
        }
    });

    let poll = std::time::Duration::from_millis(500);
    while !handle.is_finished() {
        if let Some(current) = store.get_job(&job.job_id).await? {
            pb.set_position(current.chunks_translated as u64);
        }
        tokio::time::sleep(poll).await;
    }
    let outcome = handle.await??;

    if let Some(current) = store.get_job(&job.job_id).await? {
        pb.set_position(current.chunks_translated as u64);
    }
    pb.finish_with_message(outcome.state.to_string());

    Ok(outcome)
}

/// Join translated chunks in order and write them to `path`
async fn write_output(store: &JsonFileStore, job_id: &str, path: &Path) -> anyhow::Result<usize> {
    let chunks = store.inner().chunks_of(job_id).await;
    let mut parts = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        match (&chunk.status, &chunk.translated_text) {
            (ChunkStatus::Translated, Some(text)) => parts.push(text.as_str()),
            _ => anyhow::bail!("chunk {} of job {} is not translated", chunk.chunk_index, job_id),
        }
    }

    tokio::fs::write(path, parts.join("\n\n"))
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(parts.len())
}

/// Pick `job_id`, or the most recently updated unfinished job
async fn resolve_job(store: &JsonFileStore, job_id: Option<String>) -> anyhow::Result<TranslationJob> {
    if let Some(job_id) = job_id {
        return store
            .get_job(&job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Job {} not found in {}", job_id, store.path().display()));
    }

    store
        .list_jobs()
        .await?
        .into_iter()
        .filter(|job| job.status != JobStatus::Completed)
        .max_by_key(|job| job.updated_at)
        .ok_or_else(|| anyhow::anyhow!("No unfinished jobs in {}", store.path().display()))
}

fn print_outcome(outcome: &WorkflowOutcome, elapsed: std::time::Duration) {
    match outcome.state {
        WorkflowState::Succeeded => println!("\n✅ Translation completed!"),
        WorkflowState::Cancelled => println!("\n⏸  Translation cancelled"),
        _ => println!("\n❌ Translation {}", outcome.state),
    }
    println!("   Job: {}", outcome.job_id);
    println!("   Status: {}", outcome.job_status);
    println!("   Translated this run: {}", outcome.processed.len());
    if let Some(index) = outcome.failed_chunk_index {
        println!("   Failed chunk: {}", index);
    }
    if let Some(error) = &outcome.error {
        println!("   Error: {}", error);
    }
    println!("   Time: {:?}", elapsed);
}

async fn finish(
    store: &JsonFileStore,
    outcome: &WorkflowOutcome,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    if outcome.state == WorkflowState::Succeeded {
        if let Some(path) = output {
            let written = write_output(store, &outcome.job_id, &path).await?;
            println!("   Output: {} ({} chunks)", path.display(), written);
        }
        return Ok(());
    }

    if outcome.state == WorkflowState::Failed {
        println!(
            "   Resume with: resume --state {} --job-id {} --retry-failed",
            store.path().display(),
            outcome.job_id
        );
        anyhow::bail!("job {} failed", outcome.job_id);
    }

    Ok(())
}

/// Handle translate command
pub async fn handle_translate(
    file: PathBuf,
    state: PathBuf,
    output: Option<PathBuf>,
    target_lang: String,
    tone: String,
    user_id: String,
) -> anyhow::Result<()> {
    let start_time = Instant::now();

    info!("Starting translation");
    info!("Input: {}", file.display());
    info!("State: {}", state.display());
    info!("Target language: {}", target_lang);

    let chunks = load_chunks(&file)?;
    let store = JsonFileStore::open(&state).await?;
    let orchestrator = live_orchestrator(&store)?;

    let job = register_job(&store, chunks, user_id, target_lang, tone).await?;
    info!(job_id = %job.job_id, total_chunks = job.total_chunks, "Registered job");

    let outcome = run_with_progress(orchestrator, &store, &job, false).await?;
    print_outcome(&outcome, start_time.elapsed());
    finish(&store, &outcome, output).await
}

/// Handle resume command
pub async fn handle_resume(
    state: PathBuf,
    job_id: Option<String>,
    retry_failed: bool,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let start_time = Instant::now();

    let store = JsonFileStore::open(&state).await?;
    let job = resolve_job(&store, job_id).await?;
    info!(
        job_id = %job.job_id,
        status = %job.status,
        translated = job.chunks_translated,
        total = job.total_chunks,
        "Resuming job"
    );

    if job.status == JobStatus::Failed && !retry_failed {
        println!(
            "Job {} failed at chunk {:?}: {}",
            job.job_id,
            job.failed_chunk_index,
            job.last_error.as_deref().unwrap_or("unknown error")
        );
        println!("Pass --retry-failed to retry it.");
        return Ok(());
    }

    let orchestrator = live_orchestrator(&store)?;
    let retry = retry_failed && job.status == JobStatus::Failed;
    let outcome = run_with_progress(orchestrator, &store, &job, retry).await?;
    print_outcome(&outcome, start_time.elapsed());
    finish(&store, &outcome, output).await
}

/// Handle status command
pub async fn handle_status(state: PathBuf, job_id: Option<String>) -> anyhow::Result<()> {
    let store = JsonFileStore::open(&state).await?;

    let jobs = match job_id {
        Some(id) => vec![resolve_job(&store, Some(id)).await?],
        None => store.list_jobs().await?,
    };

    if jobs.is_empty() {
        println!("No jobs in {}", state.display());
        return Ok(());
    }

    for job in jobs {
        println!("\n{} [{}]", job.job_id, job.status);
        println!(
            "   Progress: {}/{} ({:.1}%)",
            job.chunks_translated,
            job.total_chunks,
            job.progress() * 100.0
        );
        println!("   Target: {} ({})", job.target_language, job.tone);
        println!("   Tokens: {} (≈ {:.4})", job.tokens_used, job.estimated_cost);
        if let Some(index) = job.failed_chunk_index {
            println!("   Failed chunk: {}", index);
        }
        if let Some(error) = &job.last_error {
            println!("   Last error: {}", error);
        }
    }

    Ok(())
}

/// Handle server command
pub async fn handle_server(host: String, port: u16) -> anyhow::Result<()> {
    use crate::server::api::run_server;

    let config = TranslatorConfig::load()?;

    info!("Starting HTTP server on {}:{}", host, port);
    println!("🚀 Server starting on http://{}:{}", host, port);

    run_server(host, port, config).await?;

    Ok(())
}

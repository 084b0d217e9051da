//! Workflow orchestrator: drives a job from CHUNKED to COMPLETED or FAILED
//!
//! The orchestrator owns scheduling only. Each chunk is handed to a worker as
//! an independent task; progress lives in the stores, never in this struct,
//! so a crashed run can be resumed by invoking the workflow again.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::TranslatorConfig;
use crate::core::errors::{Result, TranslationError};
use crate::core::models::{ChunkStatus, JobStatus, TranslationJob};
use crate::core::store::{ChunkStore, JobStore};
use crate::core::worker::{ChunkOutcome, ChunkTask, TranslateChunkWorker};

/// Orchestrator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Init,
    ChunkWait,
    Translating,
    Aggregating,
    Succeeded,
    Failed,
    /// Stopped on request; the job stays IN_PROGRESS and can be resumed
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Succeeded | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Init => write!(f, "INIT"),
            WorkflowState::ChunkWait => write!(f, "CHUNK_WAIT"),
            WorkflowState::Translating => write!(f, "TRANSLATING"),
            WorkflowState::Aggregating => write!(f, "AGGREGATING"),
            WorkflowState::Succeeded => write!(f, "SUCCEEDED"),
            WorkflowState::Failed => write!(f, "FAILED"),
            WorkflowState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Result of one workflow invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub job_id: String,
    pub state: WorkflowState,
    pub job_status: JobStatus,
    /// Chunks this invocation translated, ascending
    pub processed: Vec<u32>,
    pub failed_chunk_index: Option<u32>,
    pub error: Option<String>,
}

/// Message from a finished chunk task
struct TaskReport {
    chunk_index: u32,
    attempts: u32,
    result: Result<ChunkOutcome>,
}

/// How the translating phase ended
enum TranslatePhase {
    Done,
    Failed { chunk_index: u32, error: TranslationError },
    TimedOut { elapsed: Duration },
    Cancelled,
}

/// Drives translation jobs with bounded, dependency-aware concurrency
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    jobs: Arc<dyn JobStore>,
    chunks: Arc<dyn ChunkStore>,
    worker: TranslateChunkWorker,
    config: Arc<TranslatorConfig>,
}

impl fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("worker", &self.worker)
            .field("max_concurrent", &self.config.max_concurrent)
            .finish()
    }
}

impl WorkflowOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        chunks: Arc<dyn ChunkStore>,
        worker: TranslateChunkWorker,
        config: Arc<TranslatorConfig>,
    ) -> Self {
        Self {
            jobs,
            chunks,
            worker,
            config,
        }
    }

    pub fn worker(&self) -> &TranslateChunkWorker {
        &self.worker
    }

    /// Run (or resume) the workflow for `job_id`
    pub async fn start_workflow(&self, job_id: &str) -> Result<WorkflowOutcome> {
        self.start_workflow_with_cancel(job_id, CancellationToken::new())
            .await
    }

    /// Explicitly retry a FAILED job from its first untranslated chunk
    pub async fn retry_failed(&self, job_id: &str) -> Result<WorkflowOutcome> {
        let job = self.load_job(job_id).await?;
        if job.status != JobStatus::Failed {
            return Err(TranslationError::InvalidTransition {
                from: job.status,
                to: JobStatus::InProgress,
            });
        }

        info!(job_id, failed_chunk_index = ?job.failed_chunk_index, "Retrying failed job");
        self.jobs.clear_job_error(job_id).await?;
        self.jobs
            .update_job_status(job_id, JobStatus::InProgress)
            .await?;
        self.start_workflow(job_id).await
    }

    /// Run the workflow; cancelling `cancel` stops new chunk tasks immediately
    /// and lets in-flight ones finish.
    pub async fn start_workflow_with_cancel(
        &self,
        job_id: &str,
        cancel: CancellationToken,
    ) -> Result<WorkflowOutcome> {
        let started = Instant::now();
        let wait_deadline = started + self.config.job_timeout();

        // INIT
        let job = self.load_job(job_id).await?;
        if job.status.is_terminal() {
            info!(job_id, status = %job.status, "Job already finished, nothing to do");
            return Ok(outcome_from(&job, settled_state(job.status), vec![]));
        }
        self.enter(job_id, WorkflowState::ChunkWait);

        // CHUNK_WAIT
        let job = match self.wait_for_chunks(job_id, wait_deadline, &cancel).await? {
            Some(job) => job,
            None if cancel.is_cancelled() => {
                let job = self.load_job(job_id).await?;
                return Ok(outcome_from(&job, WorkflowState::Cancelled, vec![]));
            }
            None => {
                let error = TranslationError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                return self.fail_job(job_id, None, &error, vec![]).await;
            }
        };
        let job = if job.status == JobStatus::Chunked {
            self.jobs
                .update_job_status(job_id, JobStatus::InProgress)
                .await?
        } else {
            job
        };
        let deadline = self.job_deadline(&job);
        self.enter(job_id, WorkflowState::Translating);

        // TRANSLATING
        let mut processed = Vec::new();
        let phase = self
            .translate_chunks(&job, deadline, &cancel, &mut processed)
            .await?;
        processed.sort_unstable();

        match phase {
            TranslatePhase::Done => {}
            TranslatePhase::Failed { chunk_index, error } => {
                return self
                    .fail_job(job_id, Some(chunk_index), &error, processed)
                    .await;
            }
            TranslatePhase::TimedOut { elapsed } => {
                let first_missing = self.first_untranslated(job_id).await?;
                let error = TranslationError::Timeout {
                    elapsed_ms: elapsed.as_millis() as u64,
                };
                return self.fail_job(job_id, first_missing, &error, processed).await;
            }
            TranslatePhase::Cancelled => {
                warn!(job_id, processed = processed.len(), "Workflow cancelled");
                let job = self.load_job(job_id).await?;
                return Ok(outcome_from(&job, WorkflowState::Cancelled, processed));
            }
        }

        // AGGREGATING
        self.enter(job_id, WorkflowState::Aggregating);
        if let Some(missing) = self.first_untranslated(job_id).await? {
            let error = TranslationError::terminal(format!(
                "chunk {} is not translated after all tasks finished",
                missing
            ));
            return self.fail_job(job_id, Some(missing), &error, processed).await;
        }

        let job = self
            .jobs
            .update_job_status(job_id, JobStatus::Completed)
            .await?;
        self.enter(job_id, WorkflowState::Succeeded);
        info!(
            job_id,
            total_chunks = job.total_chunks,
            tokens_used = job.tokens_used,
            estimated_cost = job.estimated_cost,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Job completed"
        );
        Ok(outcome_from(&job, WorkflowState::Succeeded, processed))
    }

    /// The budget runs from the job's start, so a resume only gets what is left
    fn job_deadline(&self, job: &TranslationJob) -> Instant {
        let spent = job
            .started_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
            .unwrap_or_default();
        Instant::now() + self.config.job_timeout().saturating_sub(spent)
    }

    fn enter(&self, job_id: &str, state: WorkflowState) {
        debug!(job_id, state = %state, "Workflow state");
    }

    async fn load_job(&self, job_id: &str) -> Result<TranslationJob> {
        self.jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| TranslationError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Poll until chunking is confirmed and every chunk row is visible.
    /// `None` means the wait timed out or was cancelled.
    async fn wait_for_chunks(
        &self,
        job_id: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<TranslationJob>> {
        let wait_deadline =
            (Instant::now() + Duration::from_secs(self.config.chunk_wait_timeout_secs)).min(deadline);

        loop {
            let job = self.load_job(job_id).await?;
            if matches!(job.status, JobStatus::Chunked | JobStatus::InProgress) {
                let present = self.chunks.list_chunk_statuses(job_id).await?.len() as u32;
                if present >= job.total_chunks {
                    return Ok(Some(job));
                }
                debug!(job_id, present, total = job.total_chunks, "Waiting for chunk rows");
            } else {
                debug!(job_id, status = %job.status, "Waiting for chunking to finish");
            }

            if Instant::now() >= wait_deadline {
                warn!(job_id, "Chunks never became available");
                return Ok(None);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = sleep(self.config.poll_interval()) => {}
            }
        }
    }

    async fn first_untranslated(&self, job_id: &str) -> Result<Option<u32>> {
        let job = self.load_job(job_id).await?;
        let statuses = self.chunks.list_chunk_statuses(job_id).await?;
        let translated: BTreeSet<u32> = statuses
            .iter()
            .filter(|(_, status)| *status == ChunkStatus::Translated)
            .map(|(index, _)| *index)
            .collect();
        Ok((0..job.total_chunks).find(|index| !translated.contains(index)))
    }

    /// Indices a chunk must wait for before it may start: at least N-1 and
    /// N-2, or the whole context window when it reaches further back
    fn dependencies(&self, chunk_index: u32) -> impl Iterator<Item = u32> {
        let depth = if self.config.max_concurrent > 1 {
            self.config.context_chunk_count.max(2) as u32
        } else {
            0
        };
        chunk_index.saturating_sub(depth)..chunk_index
    }

    /// Schedule every untranslated chunk in ascending order with at most
    /// `max_concurrent` tasks in flight
    async fn translate_chunks(
        &self,
        job: &TranslationJob,
        deadline: Instant,
        cancel: &CancellationToken,
        processed: &mut Vec<u32>,
    ) -> Result<TranslatePhase> {
        let statuses = self.chunks.list_chunk_statuses(&job.job_id).await?;
        let mut translated: BTreeSet<u32> = statuses
            .iter()
            .filter(|(_, status)| *status == ChunkStatus::Translated)
            .map(|(index, _)| *index)
            .collect();
        let mut queue: VecDeque<u32> = (0..job.total_chunks)
            .filter(|index| !translated.contains(index))
            .collect();

        if let Some(first) = queue.front() {
            info!(
                job_id = %job.job_id,
                resume_from = first,
                remaining = queue.len(),
                already_translated = translated.len(),
                "Scheduling chunks"
            );
        }

        let mut in_flight: JoinSet<TaskReport> = JoinSet::new();
        let limit = self.config.max_concurrent;

        loop {
            let pending = !queue.is_empty() || !in_flight.is_empty();
            if pending && Instant::now() >= deadline {
                return Ok(self.time_out(job, &mut in_flight, deadline));
            }
            if !cancel.is_cancelled() {
                // Launch in ascending order; a blocked head blocks everything behind it
                while in_flight.len() < limit {
                    let Some(&next) = queue.front() else { break };
                    if !self.dependencies(next).all(|dep| translated.contains(&dep)) {
                        break;
                    }
                    queue.pop_front();
                    self.spawn_chunk_task(&mut in_flight, job, next);
                }
            }

            if in_flight.is_empty() {
                if cancel.is_cancelled() && !queue.is_empty() {
                    return Ok(TranslatePhase::Cancelled);
                }
                if queue.is_empty() {
                    return Ok(TranslatePhase::Done);
                }
                // Nothing running and the head is still blocked: a dependency
                // is outside this run's reach
                let head = queue[0];
                return Ok(TranslatePhase::Failed {
                    chunk_index: head,
                    error: TranslationError::terminal(format!(
                        "dependencies of chunk {} can never be satisfied",
                        head
                    )),
                });
            }

            let joined = tokio::select! {
                joined = in_flight.join_next() => joined,
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(self.time_out(job, &mut in_flight, deadline));
                }
                _ = cancel.cancelled(), if !queue.is_empty() && !cancel.is_cancelled() => {
                    info!(job_id = %job.job_id, in_flight = in_flight.len(), "Cancellation requested, draining");
                    continue;
                }
            };

            let report = match joined {
                Some(Ok(report)) => report,
                Some(Err(join_error)) => {
                    return Err(TranslationError::InternalError(format!(
                        "chunk task panicked: {}",
                        join_error
                    )))
                }
                None => continue,
            };

            match report.result {
                Ok(outcome) => {
                    if matches!(outcome, ChunkOutcome::Translated { .. }) {
                        processed.push(report.chunk_index);
                    }
                    translated.insert(report.chunk_index);
                }
                Err(error) => {
                    error!(
                        job_id = %job.job_id,
                        chunk_index = report.chunk_index,
                        attempts = report.attempts,
                        kind = %error.kind(),
                        "Chunk failed: {}",
                        error
                    );
                    if let Err(e) = self
                        .chunks
                        .mark_chunk_failed(&job.job_id, report.chunk_index)
                        .await
                    {
                        warn!(job_id = %job.job_id, "Could not mark chunk failed: {}", e);
                    }
                    in_flight.detach_all();
                    return Ok(TranslatePhase::Failed {
                        chunk_index: report.chunk_index,
                        error,
                    });
                }
            }
        }
    }

    fn time_out(
        &self,
        job: &TranslationJob,
        in_flight: &mut JoinSet<TaskReport>,
        deadline: Instant,
    ) -> TranslatePhase {
        let elapsed = self.config.job_timeout() + Instant::now().saturating_duration_since(deadline);
        error!(job_id = %job.job_id, in_flight = in_flight.len(), "Job exceeded its time budget");
        // In-flight calls cannot be recalled; let them finish on their own
        in_flight.detach_all();
        TranslatePhase::TimedOut { elapsed }
    }

    /// Spawn one chunk task carrying its own outer retry loop
    fn spawn_chunk_task(&self, in_flight: &mut JoinSet<TaskReport>, job: &TranslationJob, chunk_index: u32) {
        let worker = self.worker.clone();
        let config = self.config.clone();
        let task = ChunkTask {
            job_id: job.job_id.clone(),
            chunk_index,
            target_language: job.target_language.clone(),
            tone: job.tone.clone(),
            context_chunk_count: config.context_chunk_count,
        };

        debug!(job_id = %task.job_id, chunk_index, "Launching chunk task");
        in_flight.spawn(async move {
            let mut attempt = 1;
            loop {
                let result = worker.run(&task).await;
                match result {
                    Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                        attempt += 1;
                        let delay = config.backoff_delay(attempt);
                        warn!(
                            job_id = %task.job_id,
                            chunk_index,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            kind = %e.kind(),
                            "Retrying chunk: {}",
                            e
                        );
                        sleep(delay).await;
                    }
                    result => {
                        return TaskReport {
                            chunk_index,
                            attempts: attempt,
                            result,
                        }
                    }
                }
            }
        });
    }

    /// Record the failure and move the job to FAILED
    async fn fail_job(
        &self,
        job_id: &str,
        chunk_index: Option<u32>,
        error: &TranslationError,
        processed: Vec<u32>,
    ) -> Result<WorkflowOutcome> {
        self.jobs
            .record_job_error(job_id, chunk_index, &error.to_string())
            .await?;
        let current = self.load_job(job_id).await?;
        // FAILED is only reachable from IN_PROGRESS; earlier the error is just recorded
        let job = if current.status == JobStatus::InProgress {
            self.jobs.update_job_status(job_id, JobStatus::Failed).await?
        } else {
            current
        };
        self.enter(job_id, WorkflowState::Failed);
        error!(job_id, failed_chunk_index = ?chunk_index, kind = %error.kind(), "Job failed: {}", error);
        Ok(outcome_from(&job, WorkflowState::Failed, processed))
    }
}

fn settled_state(status: JobStatus) -> WorkflowState {
    match status {
        JobStatus::Completed => WorkflowState::Succeeded,
        JobStatus::Failed => WorkflowState::Failed,
        _ => WorkflowState::Init,
    }
}

fn outcome_from(job: &TranslationJob, state: WorkflowState, processed: Vec<u32>) -> WorkflowOutcome {
    WorkflowOutcome {
        job_id: job.job_id.clone(),
        state,
        job_status: job.status,
        processed,
        failed_chunk_index: job.failed_chunk_index,
        error: job.last_error.clone(),
    }
}

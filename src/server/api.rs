//! HTTP API server implementation
//!
//! Progress is observed by polling `GET /jobs/:id`; there is no push channel.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::bucket_store::InMemoryBucketStore;
use crate::core::client::AsyncTranslator;
use crate::core::clock::SystemClock;
use crate::core::config::TranslatorConfig;
use crate::core::models::{estimate_tokens, Chunk, JobStatus, TranslatedChunk, TranslationJob};
use crate::core::orchestrator::WorkflowOrchestrator;
use crate::core::rate_limiter::RateLimiter;
use crate::core::store::{ChunkStore, InMemoryStore, JobStore};
use crate::core::worker::TranslateChunkWorker;

/// Application state
pub struct AppState {
    orchestrator: WorkflowOrchestrator,
    store: InMemoryStore,
    /// Cancellation handles of workflows started by this server
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl AppState {
    pub fn new(orchestrator: WorkflowOrchestrator, store: InMemoryStore) -> Self {
        Self {
            orchestrator,
            store,
            running: Mutex::new(HashMap::new()),
        }
    }
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

/// One pre-split chunk of a document
#[derive(Deserialize)]
pub struct ChunkInput {
    pub source_text: String,
    pub token_count: Option<u32>,
}

/// Registration of a document that has already been chunked
#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub user_id: String,
    pub target_language: String,
    pub tone: Option<String>,
    pub chunks: Vec<ChunkInput>,
}

/// Job status as returned to pollers
#[derive(Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: TranslationJob,
    pub progress: f64,
    pub running: bool,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                message: message.into(),
                code: Some(code.to_string()),
            },
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
}

async fn job_response(state: &AppState, job_id: &str) -> ApiResult<JobResponse> {
    let job = state
        .store
        .get_job(job_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "job_not_found", format!("unknown job {}", job_id)))?;
    let running = state.running.lock().await.contains_key(job_id);

    Ok(Json(JobResponse {
        progress: job.progress(),
        job,
        running,
    }))
}

/// Health check handler
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "chunk-translator".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Register an already-chunked document as a CHUNKED job
async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), (StatusCode, Json<ErrorResponse>)> {
    if payload.chunks.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "chunks cannot be empty",
        ));
    }

    let job_id = uuid::Uuid::new_v4().to_string();
    let job = TranslationJob::new(
        job_id.clone(),
        payload.user_id,
        payload.target_language,
        payload.tone.unwrap_or_else(|| "neutral".to_string()),
        payload.chunks.len() as u32,
    )
    .with_status(JobStatus::Chunked);

    let chunks = payload
        .chunks
        .into_iter()
        .enumerate()
        .map(|(index, input)| {
            let tokens = input
                .token_count
                .unwrap_or_else(|| estimate_tokens(&input.source_text));
            Chunk::new(job_id.clone(), index as u32, input.source_text, tokens)
        })
        .collect();

    state.store.put_chunks(chunks).await.map_err(internal)?;
    state.store.create_job(job).await.map_err(internal)?;
    info!(job_id = %job_id, "Registered chunked job");

    let response = job_response(&state, &job_id).await?;
    Ok((StatusCode::CREATED, response))
}

/// Launch (or resume) the workflow in the background
async fn start_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<JobResponse>), (StatusCode, Json<ErrorResponse>)> {
    // 404 before anything is spawned
    job_response(&state, &job_id).await?;

    let cancel = CancellationToken::new();
    {
        let mut running = state.running.lock().await;
        if running.contains_key(&job_id) {
            return Err(api_error(
                StatusCode::CONFLICT,
                "already_running",
                format!("job {} is already running", job_id),
            ));
        }
        running.insert(job_id.clone(), cancel.clone());
    }

    let background = state.clone();
    let id = job_id.clone();
    tokio::spawn(async move {
        match background
            .orchestrator
            .start_workflow_with_cancel(&id, cancel)
            .await
        {
            Ok(outcome) => info!(job_id = %id, state = %outcome.state, "Workflow finished"),
            Err(e) => warn!(job_id = %id, "Workflow aborted: {}", e),
        }
        background.running.lock().await.remove(&id);
    });

    let response = job_response(&state, &job_id).await?;
    Ok((StatusCode::ACCEPTED, response))
}

/// Stop scheduling new chunks for a running job
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<JobResponse>), (StatusCode, Json<ErrorResponse>)> {
    let token = state.running.lock().await.get(&job_id).cloned();
    let Some(token) = token else {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "not_running",
            format!("job {} is not running", job_id),
        ));
    };

    token.cancel();
    info!(job_id = %job_id, "Cancellation requested");
    let response = job_response(&state, &job_id).await?;
    Ok((StatusCode::ACCEPTED, response))
}

/// Poll job status
async fn get_job(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> ApiResult<JobResponse> {
    job_response(&state, &job_id).await
}

/// Fetch one translated chunk
async fn get_chunk(
    State(state): State<Arc<AppState>>,
    Path((job_id, chunk_index)): Path<(String, u32)>,
) -> ApiResult<TranslatedChunk> {
    state
        .store
        .get_translated_chunk(&job_id, chunk_index)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "chunk_not_translated",
                format!("chunk {} of job {} is not translated", chunk_index, job_id),
            )
        })
}

/// Create router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/jobs", post(create_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/start", post(start_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/chunks/:index", get(get_chunk))
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(host: String, port: u16, config: TranslatorConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let store = InMemoryStore::new();
    let clock = Arc::new(SystemClock);
    let limiter = RateLimiter::new(
        Arc::new(InMemoryBucketStore::with_clock(clock.clone())),
        clock,
        config.buckets.clone(),
    );
    let translator = Arc::new(AsyncTranslator::new(config.as_ref().clone())?);
    let worker = TranslateChunkWorker::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        translator,
        limiter.clone(),
        config.clone(),
    );
    let orchestrator = WorkflowOrchestrator::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        worker,
        config,
    );

    // Periodically drop rate-limit buckets nobody has touched in a while
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            if let Err(e) = limiter.reclaim_idle().await {
                warn!("Bucket sweep failed: {}", e);
            }
        }
    });

    let state = Arc::new(AppState::new(orchestrator, store));
    let app = router(state);

    // Bind address
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    info!("Starting server on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::config::{BucketConfig, REQUEST_BUCKET};
    use crate::core::errors::ErrorKind;
    use crate::core::testing::ScriptedApi;

    fn state_with(api: ScriptedApi) -> Arc<AppState> {
        let config = Arc::new(TranslatorConfig {
            retry_delay_ms: 1,
            poll_interval_ms: 5,
            ..Default::default()
        });
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let limiter = RateLimiter::new(
            Arc::new(InMemoryBucketStore::with_clock(clock.clone())),
            clock,
            vec![BucketConfig {
                key: REQUEST_BUCKET.to_string(),
                capacity: 1_000_000.0,
                refill_rate_per_second: 1000.0,
                ttl_secs: 3600,
            }],
        );
        let worker = TranslateChunkWorker::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(api),
            limiter,
            config.clone(),
        );
        let orchestrator =
            WorkflowOrchestrator::new(Arc::new(store.clone()), Arc::new(store.clone()), worker, config);
        Arc::new(AppState::new(orchestrator, store))
    }

    fn request(texts: &[&str]) -> CreateJobRequest {
        CreateJobRequest {
            user_id: "user-1".to_string(),
            target_language: "it".to_string(),
            tone: None,
            chunks: texts
                .iter()
                .map(|t| ChunkInput {
                    source_text: t.to_string(),
                    token_count: None,
                })
                .collect(),
        }
    }

    async fn wait_until_settled(state: &Arc<AppState>, job_id: &str) -> JobResponse {
        for _ in 0..200 {
            let Json(response) = get_job(State(state.clone()), Path(job_id.to_string()))
                .await
                .ok()
                .unwrap();
            if response.job.status.is_terminal() && !response.running {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never settled", job_id);
    }

    #[tokio::test]
    async fn test_create_start_and_poll() {
        let state = state_with(ScriptedApi::new());

        let (status, Json(created)) = create_job(State(state.clone()), Json(request(&["uno", "due"])))
            .await
            .ok()
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.job.status, JobStatus::Chunked);
        assert_eq!(created.job.tone, "neutral");
        let job_id = created.job.job_id.clone();

        let (status, _) = start_job(State(state.clone()), Path(job_id.clone()))
            .await
            .ok()
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let settled = wait_until_settled(&state, &job_id).await;
        assert_eq!(settled.job.status, JobStatus::Completed);
        assert_eq!(settled.progress, 1.0);

        let Json(chunk) = get_chunk(State(state.clone()), Path((job_id, 1))).await.ok().unwrap();
        assert_eq!(chunk.translated_text, "[it] due");
    }

    #[tokio::test]
    async fn test_failed_job_reports_chunk() {
        let api = ScriptedApi::new();
        api.fail_next("secondo", ErrorKind::Terminal);
        let state = state_with(api);

        let (_, Json(created)) = create_job(State(state.clone()), Json(request(&["primo", "secondo"])))
            .await
            .ok()
            .unwrap();
        let job_id = created.job.job_id.clone();
        let (status, _) = start_job(State(state.clone()), Path(job_id.clone()))
            .await
            .ok()
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let settled = wait_until_settled(&state, &job_id).await;
        assert_eq!(settled.job.status, JobStatus::Failed);
        assert_eq!(settled.job.failed_chunk_index, Some(1));

        let missing = get_chunk(State(state.clone()), Path((job_id, 1))).await;
        assert_eq!(missing.err().unwrap().0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let state = state_with(ScriptedApi::new());

        let err = get_job(State(state.clone()), Path("missing".to_string()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let err = start_job(State(state.clone()), Path("missing".to_string()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let err = cancel_job(State(state), Path("missing".to_string()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_document_rejected() {
        let state = state_with(ScriptedApi::new());
        let err = create_job(State(state), Json(request(&[])))
            .await
            .err()
            .unwrap();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}

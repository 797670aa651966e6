use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use fleet_common::{InstructionExecutor, InstructionMode, LogStream, OutputLine};
use serde::Deserialize;

use super::broadcaster::EventBroadcaster;
use super::db::DbHandle;
use super::logs::{LogStreamPipeline, OutputSource};
use super::metrics::{MetricsSampler, MetricsSource};
use super::models::{EnqueueOptions, LogQuery, QueueStatus};
use super::queue::QueueManager;
use super::rate_limit::RateLimiter;
use crate::config::FleetConfig;
use crate::errors::FleetError;

/// Shared services handed to every HTTP and WebSocket handler.
pub struct AppState {
    pub broadcaster: Arc<EventBroadcaster>,
    pub queues: QueueManager,
    pub logs: Arc<LogStreamPipeline>,
    pub metrics: Arc<MetricsSampler>,
    pub limiter: RateLimiter,
    pub outbound_buffer: usize,
    pub shutdown_grace: Duration,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the services together and register channel hooks. The
    /// broadcaster is not marked ready; the server does that once it is
    /// listening.
    pub fn new(
        config: &FleetConfig,
        db: DbHandle,
        executor: Arc<dyn InstructionExecutor>,
        output: Option<Arc<dyn OutputSource>>,
        metrics: Option<Arc<dyn MetricsSource>>,
    ) -> SharedState {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let queues = QueueManager::new(
            db.clone(),
            Arc::clone(&broadcaster),
            executor,
            config.queue.clone(),
        );
        let logs = LogStreamPipeline::new(
            config.logs.clone(),
            db,
            Arc::clone(&broadcaster),
            output,
        );
        logs.install_hooks();
        let metrics = MetricsSampler::new(
            config.sandbox.metrics_interval,
            Arc::clone(&broadcaster),
            metrics,
        );
        metrics.install_hooks();
        Arc::new(Self {
            broadcaster,
            queues,
            logs,
            metrics,
            limiter: RateLimiter::new(config.rate_limit.clone()),
            outbound_buffer: config.server.outbound_buffer,
            shutdown_grace: config.server.shutdown_grace,
        })
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub text: String,
    #[serde(default = "default_mode")]
    pub mode: InstructionMode,
    pub max_attempts: Option<u32>,
}

fn default_mode() -> InstructionMode {
    InstructionMode::Autonomous
}

#[derive(Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

impl LimitParams {
    fn limit_or(&self, default: usize) -> usize {
        self.limit.unwrap_or(default)
    }
}

#[derive(Deserialize)]
pub struct LogHistoryParams {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub stream: Option<LogStream>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Deserialize)]
pub struct IngestRequest {
    pub logs: Vec<IngestLine>,
}

#[derive(Deserialize)]
pub struct IngestLine {
    #[serde(default = "default_stream")]
    pub stream: LogStream,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
}

fn default_stream() -> LogStream {
    LogStream::Stdout
}

// ── Error type ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retry_after_ms: Option<u64>,
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        let status = match &err {
            FleetError::Validation(_) => StatusCode::BAD_REQUEST,
            FleetError::QueueFull { .. } | FleetError::RateLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            FleetError::JobNotFound { .. } | FleetError::QueueNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            FleetError::InvalidStateTransition { .. } | FleetError::QueueClosed { .. } => {
                StatusCode::CONFLICT
            }
            FleetError::ChannelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            FleetError::Executor(_) => StatusCode::BAD_GATEWAY,
            FleetError::Database(_) | FleetError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, code = err.code(), "request failed");
        }
        let retry_after_ms = match &err {
            FleetError::RateLimited { retry_after, .. } => Some(retry_after.as_millis() as u64),
            _ => None,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
            retry_after_ms,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "error": self.message, "code": self.code });
        if let Some(ms) = self.retry_after_ms {
            body["retryAfter"] = ms.into();
        }
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/stats", get(get_stats))
        .route("/api/containers", get(list_containers))
        .route("/api/containers/{id}", delete(destroy_container))
        .route("/api/containers/{id}/instructions", post(enqueue_instruction))
        .route("/api/containers/{id}/queue", get(queue_status).delete(clear_queue))
        .route("/api/containers/{id}/queue/pending", get(pending_jobs))
        .route("/api/containers/{id}/queue/history", get(job_history))
        .route("/api/containers/{id}/queue/dead-letter", get(dead_letter_jobs))
        .route("/api/containers/{id}/queue/pause", post(pause_queue))
        .route("/api/containers/{id}/queue/resume", post(resume_queue))
        .route(
            "/api/containers/{id}/jobs/{job_id}",
            get(get_job).delete(delete_job),
        )
        .route("/api/containers/{id}/jobs/{job_id}/cancel", post(cancel_job))
        .route("/api/containers/{id}/jobs/{job_id}/retry", post(retry_job))
        .route(
            "/api/containers/{id}/logs",
            get(log_history).post(ingest_logs),
        )
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_stats(State(state): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "connections": state.broadcaster.connection_count(),
        "channels": state.broadcaster.registry().channel_count(),
        "droppedFrames": state.broadcaster.dropped_frames(),
        "queues": state.queues.active_queues().await,
        "rateLimitEntries": state.limiter.tracked_entries(),
        "logs": state.logs.stats(),
    }))
}

async fn list_containers(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.queues.container_ids().await)
}

async fn destroy_container(
    State(state): State<SharedState>,
    Path(container_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    fleet_common::validate_container_id(&container_id).map_err(FleetError::from)?;
    let destroyed = state
        .queues
        .destroy(&container_id, state.shutdown_grace)
        .await;
    Ok(Json(serde_json::json!({ "destroyed": destroyed })))
}

async fn enqueue_instruction(
    State(state): State<SharedState>,
    Path(container_id): Path<String>,
    Json(req): Json<EnqueueRequest>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state
        .queues
        .enqueue(
            &container_id,
            &req.text,
            req.mode,
            EnqueueOptions {
                max_attempts: req.max_attempts,
            },
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn queue_status(
    State(state): State<SharedState>,
    Path(container_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let status = match state.queues.get(&container_id).await? {
        Some(queue) => queue.status().await,
        None => QueueStatus::default(),
    };
    Ok(Json(status))
}

async fn clear_queue(
    State(state): State<SharedState>,
    Path(container_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let removed = match state.queues.get(&container_id).await? {
        Some(queue) => queue.clear().await?,
        None => 0,
    };
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn pending_jobs(
    State(state): State<SharedState>,
    Path(container_id): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<impl IntoResponse> {
    let jobs = match state.queues.get(&container_id).await? {
        Some(queue) => queue.pending(params.limit_or(50)).await,
        None => Vec::new(),
    };
    Ok(Json(jobs))
}

async fn job_history(
    State(state): State<SharedState>,
    Path(container_id): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<impl IntoResponse> {
    let jobs = match state.queues.get(&container_id).await? {
        Some(queue) => queue.history(params.limit_or(50)).await,
        None => Vec::new(),
    };
    Ok(Json(jobs))
}

async fn dead_letter_jobs(
    State(state): State<SharedState>,
    Path(container_id): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<impl IntoResponse> {
    let jobs = match state.queues.get(&container_id).await? {
        Some(queue) => queue.dead_letter(params.limit_or(50)).await,
        None => Vec::new(),
    };
    Ok(Json(jobs))
}

async fn pause_queue(
    State(state): State<SharedState>,
    Path(container_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let queue = state.queues.require(&container_id).await?;
    queue.pause().await;
    Ok(Json(queue.status().await))
}

async fn resume_queue(
    State(state): State<SharedState>,
    Path(container_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let queue = state.queues.require(&container_id).await?;
    queue.resume().await;
    Ok(Json(queue.status().await))
}

async fn get_job(
    State(state): State<SharedState>,
    Path((container_id, job_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let queue = state.queues.require(&container_id).await?;
    Ok(Json(queue.job(&job_id).await?))
}

async fn delete_job(
    State(state): State<SharedState>,
    Path((container_id, job_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let queue = state.queues.require(&container_id).await?;
    queue.delete(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path((container_id, job_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let queue = state.queues.require(&container_id).await?;
    if queue.cancel(&job_id).await? {
        return Ok(Json(serde_json::json!({ "cancelled": true })));
    }
    let detail = queue.job(&job_id).await?;
    Err(FleetError::InvalidStateTransition {
        job_id,
        status: detail.job.status,
        action: "cancel",
    }
    .into())
}

async fn retry_job(
    State(state): State<SharedState>,
    Path((container_id, job_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let queue = state.queues.require(&container_id).await?;
    Ok((StatusCode::ACCEPTED, Json(queue.retry(&job_id).await?)))
}

async fn log_history(
    State(state): State<SharedState>,
    Path(container_id): Path<String>,
    Query(params): Query<LogHistoryParams>,
) -> ApiResult<impl IntoResponse> {
    let defaults = LogQuery::default();
    let query = LogQuery {
        since: params.since,
        until: params.until,
        stream: params.stream,
        limit: params.limit.unwrap_or(defaults.limit),
        offset: params.offset.unwrap_or(defaults.offset),
    };
    Ok(Json(state.logs.history(&container_id, query).await?))
}

async fn ingest_logs(
    State(state): State<SharedState>,
    Path(container_id): Path<String>,
    Json(req): Json<IngestRequest>,
) -> ApiResult<impl IntoResponse> {
    let submitted = req.logs.len();
    let lines: Vec<OutputLine> = req
        .logs
        .into_iter()
        .map(|line| OutputLine {
            stream: line.stream,
            content: line.content,
            timestamp: line.timestamp,
        })
        .collect();
    let stored = state.logs.add_logs(&container_id, lines).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "submitted": submitted,
            "accepted": stored.len(),
            "droppedTotal": state.logs.dropped(&container_id),
        })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use fleet_common::{ExecutorError, Job, JobOutput, ProgressReporter};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Parked;

    #[async_trait::async_trait]
    impl InstructionExecutor for Parked {
        async fn execute(
            &self,
            _job: &Job,
            _progress: ProgressReporter,
        ) -> Result<JobOutput, ExecutorError> {
            std::future::pending().await
        }
    }

    fn test_state(config: FleetConfig) -> SharedState {
        let state = AppState::new(
            &config,
            DbHandle::in_memory().unwrap(),
            Arc::new(Parked),
            None,
            None,
        );
        state.broadcaster.mark_ready();
        state
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn app(state: SharedState) -> Router {
        api_router().with_state(state)
    }

    /// Router over a state whose `c1` queue already exists and is paused.
    async fn paused_app(config: FleetConfig) -> Router {
        let state = test_state(config);
        state.queues.queue("c1").await.unwrap().pause().await;
        app(state)
    }

    #[tokio::test]
    async fn test_health() {
        let app = app(test_state(FleetConfig::default()));
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_enqueue_accepted_with_receipt() {
        let app = paused_app(FleetConfig::default()).await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/containers/c1/instructions",
            Some(serde_json::json!({ "text": "fix the build", "mode": "interactive" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["position"], 1);
        assert_eq!(body["status"], "waiting");
        assert!(body["id"].is_string());

        let (_, status_body) = send(&app, "GET", "/api/containers/c1/queue", None).await;
        assert_eq!(status_body["waiting"], 1);
        assert_eq!(status_body["isPaused"], true);
    }

    #[tokio::test]
    async fn test_validation_maps_to_400() {
        let app = app(test_state(FleetConfig::default()));
        let (status, body) = send(
            &app,
            "POST",
            "/api/containers/c1/instructions",
            Some(serde_json::json!({ "text": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");

        let (status, _) = send(&app, "GET", "/api/containers/bad%20id/queue", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_queue_full_maps_to_429() {
        let mut config = FleetConfig::default();
        config.queue.max_waiting = 1;
        let app = paused_app(config).await;
        let body = serde_json::json!({ "text": "one" });
        let (first, _) = send(&app, "POST", "/api/containers/c1/instructions", Some(body.clone())).await;
        assert_eq!(first, StatusCode::ACCEPTED);
        let (second, err) = send(&app, "POST", "/api/containers/c1/instructions", Some(body)).await;
        assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err["code"], "QUEUE_FULL");
    }

    #[tokio::test]
    async fn test_job_lifecycle_routes() {
        let app = paused_app(FleetConfig::default()).await;
        let (_, receipt) = send(
            &app,
            "POST",
            "/api/containers/c1/instructions",
            Some(serde_json::json!({ "text": "task" })),
        )
        .await;
        let id = receipt["id"].as_str().unwrap().to_string();

        let (status, detail) = send(&app, "GET", &format!("/api/containers/c1/jobs/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["position"], 1);

        let (status, body) = send(&app, "DELETE", &format!("/api/containers/c1/jobs/{}", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "INVALID_STATE");

        let (status, _) = send(&app, "POST", &format!("/api/containers/c1/jobs/{}/retry", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&app, "POST", &format!("/api/containers/c1/jobs/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], true);

        let (status, body) = send(&app, "GET", &format!("/api/containers/c1/jobs/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "JOB_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_clear_and_destroy() {
        let app = paused_app(FleetConfig::default()).await;
        for text in ["a", "b"] {
            send(
                &app,
                "POST",
                "/api/containers/c1/instructions",
                Some(serde_json::json!({ "text": text })),
            )
            .await;
        }
        let (_, body) = send(&app, "DELETE", "/api/containers/c1/queue", None).await;
        assert_eq!(body["removed"], 2);

        let (_, body) = send(&app, "DELETE", "/api/containers/c1", None).await;
        assert_eq!(body["destroyed"], true);
        let (_, body) = send(&app, "DELETE", "/api/containers/c1", None).await;
        assert_eq!(body["destroyed"], false);
    }

    #[tokio::test]
    async fn test_ingest_and_query_logs() {
        let app = app(test_state(FleetConfig::default()));
        let (status, body) = send(
            &app,
            "POST",
            "/api/containers/c1/logs",
            Some(serde_json::json!({ "logs": [
                { "content": "hello" },
                { "stream": "stderr", "content": "warn" },
                { "content": "" }
            ] })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["submitted"], 3);
        assert_eq!(body["accepted"], 2);

        let (_, page) = send(&app, "GET", "/api/containers/c1/logs?stream=stderr", None).await;
        assert_eq!(page["total"], 1);
        assert_eq!(page["logs"][0]["content"], "warn");
        assert_eq!(page["hasMore"], false);
    }

    #[tokio::test]
    async fn test_lookups_never_create_queues() {
        let state = test_state(FleetConfig::default());
        let app = app(state.clone());

        let (status, body) = send(&app, "GET", "/api/containers/ghost/queue", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["waiting"], 0);
        let (_, body) = send(&app, "GET", "/api/containers/ghost/queue/history", None).await;
        assert_eq!(body, serde_json::json!([]));
        let (_, body) = send(&app, "DELETE", "/api/containers/ghost/queue", None).await;
        assert_eq!(body["removed"], 0);

        let (status, body) = send(&app, "POST", "/api/containers/ghost/queue/pause", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "QUEUE_NOT_FOUND");
        let (status, _) = send(&app, "POST", "/api/containers/ghost/jobs/j1/cancel", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(state.queues.active_queues().await, 0);

        let (status, _) = send(
            &app,
            "POST",
            "/api/containers/ghost/instructions",
            Some(serde_json::json!({ "text": "now it exists" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(state.queues.active_queues().await, 1);
    }

    #[test]
    fn test_error_status_mapping() {
        let err: ApiError = FleetError::RateLimited {
            tier: super::super::rate_limit::Tier::Write,
            retry_after: Duration::from_secs(2),
        }
        .into();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.retry_after_ms, Some(2000));

        let err: ApiError = FleetError::ChannelUnavailable.into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);

        let err: ApiError = FleetError::Database(anyhow::anyhow!("disk")).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, "INTERNAL");
    }
}

//! Worker REST endpoints: runs analyses locally behind a [`BoundedQueue`].

use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ApiError, attach_request_id, parse_request};
use crate::config::WorkerConfig;
use crate::error::{ExecutorError, QueueError};
use crate::executor::AnalysisExecutor;
use crate::model::{AnalysisRequest, normalize_target};
use crate::queue::BoundedQueue;

type Running = Arc<Mutex<Vec<(Uuid, Value)>>>;

/// Application state shared across worker handlers.
#[derive(Clone)]
pub struct WorkerState {
    pub worker_id: String,
    pub queue: Arc<BoundedQueue<Value, ExecutorError>>,
    pub executor: Arc<dyn AnalysisExecutor>,
    /// Analyses currently executing, oldest first.
    running: Running,
}

impl WorkerState {
    pub fn new(config: &WorkerConfig, executor: Arc<dyn AnalysisExecutor>) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            queue: BoundedQueue::new(config.queue.clone()),
            executor,
            running: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn current_analysis(&self) -> Option<Value> {
        lock(&self.running).first().map(|(_, v)| v.clone())
    }
}

fn lock(running: &Running) -> MutexGuard<'_, Vec<(Uuid, Value)>> {
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks an analysis as running until dropped, including on panic.
struct RunningGuard {
    id: Uuid,
    running: Running,
}

impl RunningGuard {
    fn enter(running: &Running, request: &AnalysisRequest) -> Self {
        let id = Uuid::new_v4();
        let summary = json!({
            "url": request.target,
            "deviceType": request.mode,
            "startTime": Utc::now(),
        });
        lock(running).push((id, summary));
        Self {
            id,
            running: Arc::clone(running),
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock(&self.running).retain(|(id, _)| *id != self.id);
    }
}

/// Build the worker router.
pub fn worker_routes(state: WorkerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/analyze", post(analyze))
        .route("/api/queue-stats", get(queue_stats))
        .route("/api/queue-position/{id}", get(queue_position))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn rejection(err: QueueError<ExecutorError>, worker_id: &str, stats: Value) -> ApiError {
    let code = err.code();
    match err {
        QueueError::Full { stats } => ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            json!({ "error": code, "message": "Queue is full, please try again later", "queueStats": stats }),
        ),
        QueueError::Timeout {
            request_id,
            waited,
        } => ApiError::new(
            StatusCode::GATEWAY_TIMEOUT,
            json!({
                "error": code,
                "message": format!("Request timed out after {}ms in queue", waited.as_millis()),
                "queueStats": stats,
            }),
        )
        .with_request_id(request_id),
        QueueError::Task(e) => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "AnalysisFailed", "details": e.to_string(), "workerId": worker_id }),
        ),
        other @ (QueueError::Panicked { .. } | QueueError::Closed { .. }) => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "AnalysisFailed", "details": other.to_string(), "workerId": worker_id }),
        ),
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<WorkerState>) -> impl IntoResponse {
    let busy = state.queue.active_count().await > 0;
    Json(json!({
        "status": "ok",
        "workerId": state.worker_id,
        "busy": busy,
        "currentAnalysis": state.current_analysis(),
        "timestamp": Utc::now(),
    }))
}

// ── Analysis ────────────────────────────────────────────────────────────

async fn analyze(
    State(state): State<WorkerState>,
    body: Result<Json<AnalysisRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let mut request = parse_request(body)?;
    request.target = normalize_target(&request.target)?;

    info!(worker_id = %state.worker_id, url = %request.target, mode = %request.mode, "Analysis requested");

    let task = {
        let executor = Arc::clone(&state.executor);
        let running = Arc::clone(&state.running);
        let request = request.clone();
        async move {
            let _guard = RunningGuard::enter(&running, &request);
            executor.run(&request).await
        }
    };

    let timeout = state.queue.config().queue_timeout;
    let ticket = match state.queue.admit(task, timeout).await {
        Ok(ticket) => ticket,
        Err(e) => {
            let stats = json!(state.queue.stats().await);
            return Err(rejection(e, &state.worker_id, stats));
        }
    };
    let request_id = ticket.request_id().to_string();

    match ticket.outcome().await {
        Ok(report) => {
            info!(worker_id = %state.worker_id, url = %request.target, "Analysis completed");
            let mut response = (
                StatusCode::OK,
                Json(json!({
                    "url": request.target,
                    "deviceType": request.mode,
                    "timestamp": Utc::now(),
                    "workerId": state.worker_id,
                    "report": report,
                })),
            )
                .into_response();
            attach_request_id(&mut response, Some(&request_id));
            Ok(response)
        }
        Err(e) => {
            warn!(worker_id = %state.worker_id, url = %request.target, error = %e, "Analysis failed");
            let stats = json!(state.queue.stats().await);
            Err(rejection(e, &state.worker_id, stats).with_request_id(request_id))
        }
    }
}

// ── Queue introspection ─────────────────────────────────────────────────

async fn queue_stats(State(state): State<WorkerState>) -> impl IntoResponse {
    Json(state.queue.stats().await)
}

async fn queue_position(
    State(state): State<WorkerState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.queue.position(&id).await {
        Some(position) => (StatusCode::OK, Json(json!(position))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Request not found in queue"})),
        ),
    }
}

//! Coordinator REST endpoints: admission, queue introspection and health.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::{ApiError, attach_request_id, parse_request};
use crate::error::DispatchError;
use crate::model::{AnalysisRequest, QueueSnapshot};
use crate::workers::Dispatcher;

/// Application state shared across coordinator handlers.
#[derive(Clone)]
pub struct CoordinatorState {
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the coordinator router.
pub fn coordinator_routes(dispatcher: Arc<Dispatcher>) -> Router {
    let state = CoordinatorState { dispatcher };

    Router::new()
        .route("/health", get(health))
        .route("/api/analyze", post(analyze))
        .route("/api/queue-stats", get(queue_stats))
        .route("/api/queue-position/{id}", get(queue_position))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Map a dispatch failure to its HTTP status. Every body carries the error
/// code and the queue statistics at the time of the failure.
fn rejection(err: DispatchError, stats: QueueSnapshot) -> ApiError {
    let code = err.code();
    match err {
        DispatchError::QueueFull { stats } => ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            json!({ "error": code, "message": "Queue is full, please try again later", "queueStats": stats }),
        ),
        DispatchError::NoWorkersAvailable => ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "error": code, "message": "No workers available", "queueStats": stats }),
        ),
        DispatchError::QueueTimeout { job_id, waited } => ApiError::new(
            StatusCode::GATEWAY_TIMEOUT,
            json!({
                "error": code,
                "message": format!("Request timed out after {}ms in queue", waited.as_millis()),
                "jobId": job_id,
                "queueStats": stats,
            }),
        )
        .with_request_id(job_id),
        DispatchError::WorkerCallFailed {
            job_id,
            worker_id,
            source,
        } => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({
                "error": code,
                "details": source.to_string(),
                "jobId": job_id,
                "workerId": worker_id,
                "queueStats": stats,
            }),
        )
        .with_request_id(job_id),
        DispatchError::Closed { job_id } => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({
                "error": code,
                "details": format!("Job {job_id} was dropped before it settled"),
                "jobId": job_id,
                "queueStats": stats,
            }),
        )
        .with_request_id(job_id),
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<CoordinatorState>) -> impl IntoResponse {
    let stats = state.dispatcher.stats().await;
    Json(json!({
        "status": "ok",
        "service": "coordinator",
        "workers": stats.max_concurrent,
        "queueLength": stats.queue_length,
        "activeCount": stats.active_count,
    }))
}

// ── Dispatch ────────────────────────────────────────────────────────────

async fn analyze(
    State(state): State<CoordinatorState>,
    body: Result<Json<AnalysisRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = parse_request(body)?;
    info!(url = %request.target, mode = %request.mode, "Analysis requested");

    let ticket = match state.dispatcher.enqueue(request).await {
        Ok(ticket) => ticket,
        Err(e) => return Err(rejection(e, state.dispatcher.stats().await)),
    };
    let job_id = ticket.job_id().to_string();

    match ticket.outcome().await {
        Ok(outcome) => {
            let mut response = (StatusCode::OK, Json(outcome.into_body())).into_response();
            attach_request_id(&mut response, Some(&job_id));
            Ok(response)
        }
        Err(e) => Err(rejection(e, state.dispatcher.stats().await)),
    }
}

// ── Queue introspection ─────────────────────────────────────────────────

async fn queue_stats(State(state): State<CoordinatorState>) -> impl IntoResponse {
    Json(state.dispatcher.stats().await)
}

async fn queue_position(
    State(state): State<CoordinatorState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.dispatcher.position(&id).await {
        Some(position) => (StatusCode::OK, Json(json!(position))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Request not found in queue"})),
        ),
    }
}

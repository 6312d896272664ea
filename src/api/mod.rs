//! HTTP surfaces: the coordinator's dispatch API and a worker's analysis API.

pub mod coordinator;
pub mod worker;

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

use crate::error::RequestError;
use crate::model::AnalysisRequest;

pub use coordinator::{CoordinatorState, coordinator_routes};
pub use worker::{WorkerState, worker_routes};

/// Header carrying the job or request id on every analyze response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// An error response: a status code and a JSON body with an `error` code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
    request_id: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, body: Value) -> Self {
        Self {
            status,
            body,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

impl From<RequestError> for ApiError {
    fn from(e: RequestError) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            json!({ "error": e.to_string() }),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        attach_request_id(&mut response, self.request_id.as_deref());
        response
    }
}

pub(crate) fn attach_request_id(response: &mut Response, id: Option<&str>) {
    if let Some(value) = id.and_then(|id| HeaderValue::from_str(id).ok()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}

/// Accept the analyze body, turning malformed JSON into a 400 rather than
/// axum's default plain-text rejection.
pub(crate) fn parse_request(
    body: Result<Json<AnalysisRequest>, JsonRejection>,
) -> Result<AnalysisRequest, ApiError> {
    let Json(request) = body.map_err(|e| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            json!({ "error": "Invalid request body", "details": e.body_text() }),
        )
    })?;
    request.validate()?;
    Ok(request)
}

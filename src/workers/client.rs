//! HTTP client for the worker-facing surface (`POST /api/analyze`, `GET /health`).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkerCallError;
use crate::model::AnalysisRequest;

/// A worker's self-reported state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealth {
    #[serde(default)]
    pub busy: bool,
    #[serde(default)]
    pub current_analysis: Option<Value>,
}

impl WorkerHealth {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn busy_with(current_analysis: Value) -> Self {
        Self {
            busy: true,
            current_analysis: Some(current_analysis),
        }
    }
}

/// Calls made by the coordinator against a single worker.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Run one analysis synchronously on the worker at `address`.
    async fn analyze(
        &self,
        address: &str,
        request: &AnalysisRequest,
        timeout: Duration,
    ) -> Result<Value, WorkerCallError>;

    /// Fetch the worker's self-reported busy state.
    async fn health(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<WorkerHealth, WorkerCallError>;
}

/// `reqwest`-backed [`WorkerClient`].
#[derive(Clone, Default)]
pub struct HttpWorkerClient {
    http: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn map_send_error(address: &str, timeout: Duration, e: reqwest::Error) -> WorkerCallError {
        if e.is_timeout() {
            WorkerCallError::Timeout {
                address: address.to_string(),
                timeout,
            }
        } else {
            WorkerCallError::Transport {
                address: address.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

/// Pull a human-readable reason out of a worker's error body.
fn rejection_details(status: reqwest::StatusCode, body: Option<Value>) -> String {
    body.as_ref()
        .and_then(|b| {
            b.get("details")
                .and_then(Value::as_str)
                .or_else(|| b.get("error").and_then(Value::as_str))
        })
        .map(str::to_string)
        .unwrap_or_else(|| format!("Worker returned {}", status.as_u16()))
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn analyze(
        &self,
        address: &str,
        request: &AnalysisRequest,
        timeout: Duration,
    ) -> Result<Value, WorkerCallError> {
        let response = self
            .http
            .post(format!("http://{address}/api/analyze"))
            .json(request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::map_send_error(address, timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.json::<Value>().await.ok();
            return Err(WorkerCallError::Rejected {
                status: status.as_u16(),
                details: rejection_details(status, body),
            });
        }

        response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                Self::map_send_error(address, timeout, e)
            } else {
                WorkerCallError::InvalidResponse {
                    address: address.to_string(),
                    reason: e.to_string(),
                }
            }
        })
    }

    async fn health(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<WorkerHealth, WorkerCallError> {
        let response = self
            .http
            .get(format!("http://{address}/health"))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::map_send_error(address, timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WorkerCallError::Rejected {
                status: status.as_u16(),
                details: format!("Health check returned {}", status.as_u16()),
            });
        }

        response
            .json::<WorkerHealth>()
            .await
            .map_err(|e| WorkerCallError::InvalidResponse {
                address: address.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_parses_worker_report() {
        let health: WorkerHealth = serde_json::from_str(
            r#"{"status":"ok","workerId":"w1","busy":true,
                "currentAnalysis":{"url":"https://a.test","deviceType":"mobile"}}"#,
        )
        .unwrap();
        assert!(health.busy);
        assert_eq!(health.current_analysis.unwrap()["deviceType"], "mobile");
    }

    #[test]
    fn health_defaults_to_idle() {
        let health: WorkerHealth = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert_eq!(health, WorkerHealth::idle());
    }

    #[test]
    fn rejection_prefers_details_over_error() {
        let status = reqwest::StatusCode::INTERNAL_SERVER_ERROR;
        let body = serde_json::json!({"error": "AnalysisFailed", "details": "Page load failed"});
        assert_eq!(rejection_details(status, Some(body)), "Page load failed");

        let body = serde_json::json!({"error": "Worker busy"});
        assert_eq!(rejection_details(status, Some(body)), "Worker busy");

        assert_eq!(rejection_details(status, None), "Worker returned 500");
    }

    #[tokio::test]
    async fn unreachable_worker_is_a_transport_error() {
        let client = HttpWorkerClient::new();
        // Port 9 (discard) on loopback is closed in test environments.
        let err = client
            .health("127.0.0.1:9", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerCallError::Transport { .. } | WorkerCallError::Timeout { .. }
        ));
    }
}

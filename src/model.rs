//! Shared data model: jobs, worker records and queue introspection.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RequestError;

/// Which emulation profile the analysis runs with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    Mobile,
    #[default]
    Desktop,
}

impl std::fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Mobile => "mobile",
            Self::Desktop => "desktop",
        };
        write!(f, "{s}")
    }
}

/// Payload of an analysis job. Accepts the legacy `url` / `deviceType` names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    #[serde(default, alias = "url")]
    pub target: String,
    #[serde(default, alias = "deviceType")]
    pub mode: AnalysisMode,
}

impl AnalysisRequest {
    pub fn new(target: impl Into<String>, mode: AnalysisMode) -> Self {
        Self {
            target: target.into(),
            mode,
        }
    }

    /// Reject requests without a target. Does not touch the target itself.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.target.trim().is_empty() {
            return Err(RequestError::MissingTarget);
        }
        Ok(())
    }
}

/// Trim the target, default the scheme to `https://` and check it is a
/// usable http(s) URL with a host.
pub fn normalize_target(raw: &str) -> Result<String, RequestError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RequestError::MissingTarget);
    }

    let lower = trimmed.to_ascii_lowercase();
    let candidate = if lower.starts_with("http://") || lower.starts_with("https://") {
        trimmed.to_string()
    } else if trimmed.contains("://") {
        return Err(RequestError::UnsupportedScheme);
    } else {
        format!("https://{trimmed}")
    };

    let url = reqwest::Url::parse(&candidate)
        .map_err(|_| RequestError::InvalidUrl(candidate.clone()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(RequestError::UnsupportedScheme);
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url.to_string()),
        _ => Err(RequestError::MissingHost),
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Admitted, waiting for a free slot or worker.
    Waiting,
    /// Executing on a slot or worker.
    Running,
    Done,
    Failed,
    /// Evicted from the wait list before it started.
    TimedOut,
}

impl JobState {
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Waiting, Running) | (Waiting, TimedOut) | (Running, Done) | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::TimedOut)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

/// One unit of requested work.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub request: AnalysisRequest,
    pub created_at: DateTime<Utc>,
    pub state: JobState,
}

impl Job {
    pub fn new(request: AnalysisRequest) -> Self {
        Self {
            id: format!("job-{}", Uuid::new_v4().simple()),
            request,
            created_at: Utc::now(),
            state: JobState::Waiting,
        }
    }

    pub fn transition_to(&mut self, target: JobState) -> Result<(), String> {
        if !self.state.can_transition_to(target) {
            return Err(format!("Cannot transition from {} to {}", self.state, target));
        }
        self.state = target;
        Ok(())
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            target: self.request.target.clone(),
            mode: self.request.mode,
            started_at: Utc::now(),
        }
    }
}

/// What a busy worker record shows for a job this coordinator dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub target: String,
    pub mode: AnalysisMode,
    pub started_at: DateTime<Utc>,
}

/// The job a worker is believed to be running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CurrentJob {
    /// Dispatched by this coordinator.
    Dispatched(JobSummary),
    /// Adopted from the worker's own health report.
    Reported(serde_json::Value),
}

impl CurrentJob {
    /// Id of a job this coordinator dispatched, if that is what this is.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Dispatched(summary) => Some(&summary.id),
            Self::Reported(_) => None,
        }
    }
}

/// A worker replica as currently known to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    /// Dense 1..N position in the latest discovery snapshot.
    pub id: usize,
    /// `host:port`, the durable identity.
    pub address: String,
    pub busy: bool,
    pub current_job: Option<CurrentJob>,
}

impl WorkerRecord {
    pub fn idle(id: usize, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            busy: false,
            current_job: None,
        }
    }
}

/// Read-only view of a queue, computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub active_count: usize,
    pub queue_length: usize,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_analyses: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<Vec<WorkerRecord>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Processing,
    Queued,
}

/// Where a request currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePosition {
    pub status: PositionStatus,
    /// 1-indexed offset from the head of the wait list, 0 while processing.
    pub position: usize,
    pub queue_length: usize,
    pub estimated_wait_ms: u64,
}

impl QueuePosition {
    pub fn processing(queue_length: usize) -> Self {
        Self {
            status: PositionStatus::Processing,
            position: 0,
            queue_length,
            estimated_wait_ms: 0,
        }
    }

    /// Position for a waiting entry at 0-based `index`. The estimate is a hint:
    /// `(position - 1 + free slots) * average task duration`.
    pub fn queued(
        index: usize,
        queue_length: usize,
        max_concurrent: usize,
        active_count: usize,
        average: Duration,
    ) -> Self {
        let ahead = index + max_concurrent.saturating_sub(active_count);
        let estimated = average.as_millis().saturating_mul(ahead as u128);
        Self {
            status: PositionStatus::Queued,
            position: index + 1,
            queue_length,
            estimated_wait_ms: u64::try_from(estimated).unwrap_or(u64::MAX),
        }
    }
}

//! Error types for the analysis dispatcher.

use std::time::Duration;

use crate::model::QueueSnapshot;

/// Top-level error type for component construction.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown role {0:?}, expected \"coordinator\" or \"worker\"")]
    UnknownRole(String),
}

/// Admission and execution errors of a [`BoundedQueue`](crate::queue::BoundedQueue).
///
/// `E` is the wrapped task's own error type, passed through unchanged.
#[derive(Debug, thiserror::Error)]
pub enum QueueError<E> {
    #[error("Queue is full ({} waiting, max {})", .stats.queue_length, .stats.max_queue_size)]
    Full { stats: QueueSnapshot },

    #[error("Request {request_id} timed out after {waited:?} in queue")]
    Timeout { request_id: String, waited: Duration },

    #[error("Task for request {request_id} panicked")]
    Panicked { request_id: String },

    #[error("Request {request_id} was dropped before it settled")]
    Closed { request_id: String },

    #[error("{0}")]
    Task(E),
}

impl<E> QueueError<E> {
    /// Machine-checkable code surfaced to HTTP callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Full { .. } => "QueueFull",
            Self::Timeout { .. } => "QueueTimeout",
            Self::Panicked { .. } | Self::Closed { .. } => "Internal",
            Self::Task(_) => "TaskError",
        }
    }
}

/// Errors returned by the distributed dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Queue is full ({} waiting, max {})", .stats.queue_length, .stats.max_queue_size)]
    QueueFull { stats: QueueSnapshot },

    #[error("Job {job_id} timed out after {waited:?} waiting for a worker")]
    QueueTimeout { job_id: String, waited: Duration },

    #[error("No workers available")]
    NoWorkersAvailable,

    #[error("Job {job_id} failed on worker {worker_id}: {source}")]
    WorkerCallFailed {
        job_id: String,
        worker_id: usize,
        #[source]
        source: WorkerCallError,
    },

    #[error("Job {job_id} was dropped before it settled")]
    Closed { job_id: String },
}

impl DispatchError {
    /// Machine-checkable code surfaced to HTTP callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "QueueFull",
            Self::QueueTimeout { .. } => "QueueTimeout",
            Self::NoWorkersAvailable => "NoWorkersAvailable",
            Self::WorkerCallFailed { .. } => "WorkerCallFailed",
            Self::Closed { .. } => "Internal",
        }
    }
}

/// Errors from a single call to a worker's HTTP surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerCallError {
    #[error("worker {address} did not answer within {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("worker {address} unreachable: {reason}")]
    Transport { address: String, reason: String },

    #[error("{details}")]
    Rejected { status: u16, details: String },

    #[error("invalid response from {address}: {reason}")]
    InvalidResponse { address: String, reason: String },
}

/// Worker address resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to resolve {service}: {reason}")]
    Resolve { service: String, reason: String },
}

/// Errors from running the external analysis tool.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to start analyzer {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Analyzer timed out after {0:?}")]
    Timeout(Duration),

    #[error("Analyzer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Analyzer produced invalid output: {0}")]
    InvalidOutput(String),

    #[error("Page load failed: {0}")]
    RuntimeError(String),

    #[error("Analyzer command is empty")]
    EmptyCommand,
}

/// Validation errors for inbound analysis requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("URL is required")]
    MissingTarget,

    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),

    #[error("URL must use http:// or https:// protocol")]
    UnsupportedScheme,

    #[error("URL must have a valid hostname")]
    MissingHost,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

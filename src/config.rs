//! Configuration types, built from environment variables.

use std::time::Duration;

use crate::error::ConfigError;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn positive(key: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

fn nonzero(key: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Limits for a single-process [`BoundedQueue`](crate::queue::BoundedQueue).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of tasks executing at once.
    pub max_concurrent: usize,
    /// Maximum number of tasks waiting for a slot.
    pub max_queue_size: usize,
    /// How long a task may wait before it is evicted.
    pub queue_timeout: Duration,
    /// Seed for the rolling task-duration average used in wait estimates.
    pub average_task_duration: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_queue_size: 10,
            queue_timeout: Duration::from_millis(120_000),
            average_task_duration: Duration::from_millis(30_000),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent: env_parse("MAX_CONCURRENT").unwrap_or(defaults.max_concurrent),
            max_queue_size: env_parse("MAX_QUEUE_SIZE").unwrap_or(defaults.max_queue_size),
            queue_timeout: env_parse("QUEUE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.queue_timeout),
            average_task_duration: env_parse("AVG_TASK_DURATION_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.average_task_duration),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("MAX_CONCURRENT", self.max_concurrent)?;
        positive("MAX_QUEUE_SIZE", self.max_queue_size)?;
        nonzero("QUEUE_TIMEOUT_MS", self.queue_timeout)
    }
}

/// Coordinator settings: discovery, admission and polling.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Logical service name resolved to worker addresses.
    pub service_name: String,
    /// Port the workers listen on.
    pub worker_port: u16,
    /// Fixed worker addresses; when non-empty, DNS discovery is skipped.
    pub static_addresses: Vec<String>,
    pub max_queue_size: usize,
    pub queue_timeout: Duration,
    /// Per-call timeout on the remote analyze request.
    pub call_timeout: Duration,
    pub discovery_interval: Duration,
    pub health_interval: Duration,
    /// Timeout on a single `/health` probe.
    pub health_timeout: Duration,
    pub average_job_duration: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            service_name: "worker".to_string(),
            worker_port: 8080,
            static_addresses: Vec::new(),
            max_queue_size: 10,
            queue_timeout: Duration::from_millis(120_000),
            call_timeout: Duration::from_millis(120_000),
            discovery_interval: Duration::from_secs(30),
            health_interval: Duration::from_secs(10),
            health_timeout: Duration::from_millis(5_000),
            average_job_duration: Duration::from_millis(30_000),
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("WORKER_SERVICE").unwrap_or(defaults.service_name),
            worker_port: env_parse("WORKER_PORT").unwrap_or(defaults.worker_port),
            static_addresses: env_list("WORKER_ADDRESSES"),
            max_queue_size: env_parse("MAX_QUEUE_SIZE").unwrap_or(defaults.max_queue_size),
            queue_timeout: env_parse("QUEUE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.queue_timeout),
            call_timeout: env_parse("CALL_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.call_timeout),
            discovery_interval: env_parse("DISCOVERY_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.discovery_interval),
            health_interval: env_parse("HEALTH_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.health_interval),
            health_timeout: env_parse("HEALTH_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.health_timeout),
            average_job_duration: env_parse("AVG_TASK_DURATION_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.average_job_duration),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() && self.static_addresses.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "WORKER_SERVICE".to_string(),
                message: "set a service name or WORKER_ADDRESSES".to_string(),
            });
        }
        positive("MAX_QUEUE_SIZE", self.max_queue_size)?;
        nonzero("QUEUE_TIMEOUT_MS", self.queue_timeout)?;
        nonzero("CALL_TIMEOUT_MS", self.call_timeout)?;
        nonzero("DISCOVERY_INTERVAL_SECS", self.discovery_interval)?;
        nonzero("HEALTH_INTERVAL_SECS", self.health_interval)?;
        nonzero("HEALTH_TIMEOUT_MS", self.health_timeout)
    }
}

/// Default analyzer invocation. `{target}` and `{mode}` are substituted per job.
pub const DEFAULT_ANALYZER_COMMAND: &str = "lighthouse {target} --output=json --quiet \
     --only-categories=performance,accessibility,best-practices,seo \
     --form-factor={mode} --chrome-flags=--headless=new";

/// Worker-process settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifier reported in results and `/health`.
    pub worker_id: String,
    /// Whitespace-separated analyzer command line.
    pub analyzer_command: String,
    /// Hard limit on a single analyzer run.
    pub analyzer_timeout: Duration,
    pub queue: QueueConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "local".to_string(),
            analyzer_command: DEFAULT_ANALYZER_COMMAND.to_string(),
            analyzer_timeout: Duration::from_secs(90),
            queue: QueueConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id),
            analyzer_command: std::env::var("ANALYZER_COMMAND")
                .unwrap_or(defaults.analyzer_command),
            analyzer_timeout: env_parse("ANALYZER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.analyzer_timeout),
            queue: QueueConfig::from_env(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.analyzer_command.split_whitespace().next().is_none() {
            return Err(ConfigError::InvalidValue {
                key: "ANALYZER_COMMAND".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        nonzero("ANALYZER_TIMEOUT_SECS", self.analyzer_timeout)?;
        self.queue.validate()
    }
}

/// Which HTTP surface this process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Worker,
}

impl std::str::FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coordinator" | "queue-manager" => Ok(Self::Coordinator),
            "worker" => Ok(Self::Worker),
            other => Err(ConfigError::UnknownRole(other.to_string())),
        }
    }
}

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub role: Role,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let role = match std::env::var("DISPATCH_ROLE") {
            Ok(raw) => raw.parse()?,
            Err(_) => Role::Coordinator,
        };
        Ok(Self {
            role,
            port: env_parse("PORT").unwrap_or(8080),
        })
    }
}

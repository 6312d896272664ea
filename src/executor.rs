//! Runs one page analysis by shelling out to the external analyzer.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::WorkerConfig;
use crate::error::ExecutorError;
use crate::model::AnalysisRequest;

/// Maximum bytes of stderr carried into an error message.
const MAX_STDERR_SIZE: usize = 2 * 1024;

/// Produces an analysis report for a single request.
#[async_trait]
pub trait AnalysisExecutor: Send + Sync {
    async fn run(&self, request: &AnalysisRequest) -> Result<Value, ExecutorError>;
}

/// Spawns the configured command line with `{target}` and `{mode}`
/// substituted, and parses its stdout as a JSON report.
///
/// Arguments are split on whitespace and passed without a shell, so a target
/// can never inject extra arguments or commands.
pub struct CommandExecutor {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(command_line: &str, timeout: Duration) -> Result<Self, ExecutorError> {
        let command: Vec<String> = command_line.split_whitespace().map(str::to_string).collect();
        if command.is_empty() {
            return Err(ExecutorError::EmptyCommand);
        }
        Ok(Self { command, timeout })
    }

    /// Validate the worker settings and build the executor they describe.
    pub fn from_config(config: &WorkerConfig) -> crate::error::Result<Self> {
        config.validate()?;
        Ok(Self::new(&config.analyzer_command, config.analyzer_timeout)?)
    }

    fn argv(&self, request: &AnalysisRequest) -> Vec<String> {
        let mode = request.mode.to_string();
        self.command
            .iter()
            .map(|arg| arg.replace("{target}", &request.target).replace("{mode}", &mode))
            .collect()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Parse analyzer stdout, treating a reported `runtimeError` as a failure.
fn parse_report(stdout: &[u8]) -> Result<Value, ExecutorError> {
    let report: Value =
        serde_json::from_slice(stdout).map_err(|e| ExecutorError::InvalidOutput(e.to_string()))?;

    if let Some(runtime_error) = report.get("runtimeError") {
        let message = runtime_error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| runtime_error.to_string());
        return Err(ExecutorError::RuntimeError(message));
    }
    Ok(report)
}

#[async_trait]
impl AnalysisExecutor for CommandExecutor {
    async fn run(&self, request: &AnalysisRequest) -> Result<Value, ExecutorError> {
        let argv = self.argv(request);
        let (program, args) = argv.split_first().ok_or(ExecutorError::EmptyCommand)?;

        debug!(program = %program, url = %request.target, mode = %request.mode, "Starting analyzer");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Spawn {
                program: program.clone(),
                reason: e.to_string(),
            })?;

        // Dropping the child on timeout kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| ExecutorError::Spawn {
                program: program.clone(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                warn!(url = %request.target, timeout = ?self.timeout, "Analyzer timed out, killed");
                return Err(ExecutorError::Timeout(self.timeout));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::Failed {
                status: output.status.to_string(),
                stderr: truncate(stderr.trim(), MAX_STDERR_SIZE),
            });
        }

        parse_report(&output.stdout)
    }
}

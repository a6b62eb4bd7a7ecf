//! Core data models: tasks, captured output, outcomes and run aggregates

use crate::error::{EagleError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

// Input validation limits
pub const MAX_YAML_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_TASK_COUNT: usize = 1_000;
pub const MAX_COMMAND_LEN: usize = 4_096; // 4 KB
pub const MAX_OUTPUT_SIZE: usize = 10_485_760; // 10 MB

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Width of the output/error excerpt in progress lines
const SUMMARY_WIDTH: usize = 80;

/// Remote address of a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Secret half of a credential
#[derive(Clone)]
pub enum Secret {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Password(_) => f.write_str("Password(<redacted>)"),
            Secret::KeyFile { path, .. } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .finish_non_exhaustive(),
        }
    }
}

/// Username plus secret; held in memory only
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub secret: Secret,
}

impl Credential {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::Password(password.into()),
        }
    }

    pub fn key_file(username: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::KeyFile {
                path: path.into(),
                passphrase: None,
            },
        }
    }
}

/// One unit of work: a named command bound to a target.
///
/// Fields are private; a task cannot change after construction.
#[derive(Debug, Clone)]
pub struct Task {
    name: String,
    command: String,
    target: Option<Endpoint>,
    credential: Option<Credential>,
}

impl Task {
    /// Task executed over SSH on `target`
    pub fn remote(
        name: impl Into<String>,
        command: impl Into<String>,
        target: Endpoint,
        credential: Credential,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            target: Some(target),
            credential: Some(credential),
        }
    }

    /// Task executed by the local shell
    pub fn local(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            target: None,
            credential: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn target(&self) -> Option<&Endpoint> {
        self.target.as_ref()
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn is_remote(&self) -> bool {
        self.target.is_some()
    }

    /// Check the task can be executed at all
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EagleError::InvalidTask {
                name: self.name.clone(),
                reason: "name cannot be empty".to_string(),
            });
        }

        if self.command.trim().is_empty() {
            return Err(EagleError::InvalidTask {
                name: self.name.clone(),
                reason: "command cannot be empty".to_string(),
            });
        }

        if self.command.len() > MAX_COMMAND_LEN {
            return Err(EagleError::InvalidTask {
                name: self.name.clone(),
                reason: format!("command exceeds {} bytes", MAX_COMMAND_LEN),
            });
        }

        if let Some(target) = &self.target {
            if target.host.trim().is_empty() {
                return Err(EagleError::InvalidTask {
                    name: self.name.clone(),
                    reason: "target host cannot be empty".to_string(),
                });
            }
            if self.credential.is_none() {
                return Err(EagleError::MissingCredential {
                    task: self.name.clone(),
                    missing: "credential",
                });
            }
        }

        Ok(())
    }
}

/// Combined stdout+stderr of one command, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub output: String,
    pub exit_code: i32,
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Terminal state of a task
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Succeeded => write!(f, "succeeded"),
            OutcomeStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a task failed
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidTask,
    Connect,
    Run,
    NonZeroExit,
    Timeout,
    Cancelled,
}

impl FailureKind {
    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::InvalidTask | FailureKind::Cancelled)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::InvalidTask => "invalid_task",
            FailureKind::Connect => "connect",
            FailureKind::Run => "run",
            FailureKind::NonZeroExit => "non_zero_exit",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Terminal record for one task, produced exactly once per task
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub output_truncated: bool,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl TaskOutcome {
    /// Successful run with its captured output
    pub fn succeeded(
        task: &Task,
        captured: CapturedOutput,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            task_name: task.name().to_string(),
            target: task.target().map(ToString::to_string),
            status: OutcomeStatus::Succeeded,
            output: Some(captured.output),
            error: None,
            failure: None,
            exit_code: Some(captured.exit_code),
            output_truncated: captured.truncated,
            attempts: 1,
            started_at,
            duration,
        }
    }

    /// Failed run with a descriptive cause
    pub fn failed(
        task: &Task,
        kind: FailureKind,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            task_name: task.name().to_string(),
            target: task.target().map(ToString::to_string),
            status: OutcomeStatus::Failed,
            output: None,
            error: Some(error.into()),
            failure: Some(kind),
            exit_code: None,
            output_truncated: false,
            attempts: 1,
            started_at,
            duration,
        }
    }

    /// Command ran but exited non-zero; output is kept for the report
    pub fn non_zero_exit(
        task: &Task,
        captured: CapturedOutput,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let error = format!("command exited with status {}", captured.exit_code);
        Self {
            output: Some(captured.output),
            exit_code: Some(captured.exit_code),
            output_truncated: captured.truncated,
            ..Self::failed(task, FailureKind::NonZeroExit, error, started_at, duration)
        }
    }

    /// Same outcome, recorded as the result of `attempts` tries
    pub fn with_attempts(self, attempts: u32) -> Self {
        Self { attempts, ..self }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }

    /// One human-readable line: status, task, target, excerpt of output or error
    pub fn summary_line(&self) -> String {
        let marker = if self.is_success() { "ok" } else { "FAILED" };
        let target = self.target.as_deref().unwrap_or("local");
        let detail = if self.is_success() {
            self.output.as_deref().unwrap_or("")
        } else {
            self.error.as_deref().unwrap_or("")
        };
        let excerpt = excerpt(detail);
        if excerpt.is_empty() {
            format!("[{}] {} ({})", marker, self.task_name, target)
        } else {
            format!("[{}] {} ({}): {}", marker, self.task_name, target, excerpt)
        }
    }
}

/// First non-empty line, cut to SUMMARY_WIDTH characters
fn excerpt(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if line.chars().count() > SUMMARY_WIDTH {
        let cut: String = line.chars().take(SUMMARY_WIDTH - 3).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

/// All outcomes of one run, in submission order
#[derive(Debug, Clone, Serialize)]
pub struct AggregateResult {
    pub run_id: Uuid,
    pub outcomes: Vec<TaskOutcome>,
    pub duration: Duration,
}

impl AggregateResult {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_success()).count()
    }

    pub fn success_count(&self) -> usize {
        self.len() - self.failure_count()
    }

    /// True when no task failed (vacuously true for an empty run)
    pub fn is_success(&self) -> bool {
        self.failure_count() == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }
}

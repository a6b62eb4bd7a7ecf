//! Task executor: one task, one session, one outcome

use crate::models::{FailureKind, Task, TaskOutcome};
use crate::session::{SessionFactory, SessionGuard};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Runs one task to completion. Never fails: every error ends up in the outcome.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &Task) -> TaskOutcome;
}

/// Connect → run → disconnect, with a fresh session per call
///
/// Each call is one attempt. The progress line for a task is written by the
/// scheduler once the final outcome is known; attempts only log at debug level.
#[derive(Clone)]
pub struct TaskExecutor {
    factory: Arc<dyn SessionFactory>,
    attempt_timeout: Option<Duration>,
}

impl TaskExecutor {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            attempt_timeout: None,
        }
    }

    /// Bound connect plus run of every attempt; an expired attempt is a retryable timeout
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}

#[async_trait]
impl Executor for TaskExecutor {
    async fn execute(&self, task: &Task) -> TaskOutcome {
        let started_at = Utc::now();
        let start = Instant::now();

        if let Err(e) = task.validate() {
            let outcome = TaskOutcome::failed(
                task,
                FailureKind::InvalidTask,
                e.to_string(),
                started_at,
                start.elapsed(),
            );
            debug!(task = %task.name(), "Rejected: {}", outcome.summary_line());
            return outcome;
        }

        // Dropping the guard closes the session, also when this future is cancelled
        let mut session = SessionGuard::new(self.factory.create(task));

        let attempt = async {
            match session.open().await {
                Err(e) => TaskOutcome::failed(
                    task,
                    FailureKind::Connect,
                    e.to_string(),
                    started_at,
                    start.elapsed(),
                ),
                Ok(()) => match session.run(task.command()).await {
                    Err(e) => TaskOutcome::failed(
                        task,
                        FailureKind::Run,
                        e.to_string(),
                        started_at,
                        start.elapsed(),
                    ),
                    Ok(captured) if captured.success() => {
                        TaskOutcome::succeeded(task, captured, started_at, start.elapsed())
                    }
                    Ok(captured) => {
                        TaskOutcome::non_zero_exit(task, captured, started_at, start.elapsed())
                    }
                },
            }
        };

        let outcome = match self.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(outcome) => outcome,
                Err(_) => TaskOutcome::failed(
                    task,
                    FailureKind::Timeout,
                    format!("timed out after {:?}", limit),
                    started_at,
                    start.elapsed(),
                ),
            },
            None => attempt.await,
        };

        session.close();
        debug!(
            task = %task.name(),
            status = %outcome.status,
            duration_ms = outcome.duration.as_millis() as u64,
            "Attempt finished: {}",
            outcome.summary_line()
        );
        outcome
    }
}

/// Progress line for a task's final outcome; observational only
pub fn report_progress(outcome: &TaskOutcome) {
    if outcome.is_success() {
        info!(
            task = %outcome.task_name,
            status = %outcome.status,
            duration_ms = outcome.duration.as_millis() as u64,
            "{}",
            outcome.summary_line()
        );
    } else {
        warn!(
            task = %outcome.task_name,
            status = %outcome.status,
            failure = %outcome.failure.map(|f| f.to_string()).unwrap_or_default(),
            duration_ms = outcome.duration.as_millis() as u64,
            "{}",
            outcome.summary_line()
        );
    }
}

//! Concurrent scheduler: one unit of work per task, all started up front
//!
//! Every task runs in its own tokio task with its own executor call and
//! session. The scheduler waits for all of them; a failing task never stops
//! or delays the others. Each unit can be bounded by a deadline and the whole
//! run can be cancelled; in both cases the affected sessions are still closed
//! because dropping the executor future drops its session guard.

use crate::error::AggregationFault;
use crate::executor::{report_progress, Executor};
use crate::metrics::RunMetrics;
use crate::models::{AggregateResult, FailureKind, Task, TaskOutcome};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// Scheduler settings
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Overall deadline for each task, retries included; `None` waits indefinitely.
    /// Per-attempt deadlines belong on the executor.
    pub task_timeout: Option<Duration>,
}

/// Runs a task list concurrently and aggregates the outcomes
pub struct Scheduler {
    executor: Arc<dyn Executor>,
    config: SchedulerConfig,
    metrics: Option<RunMetrics>,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn Executor>, config: SchedulerConfig) -> Self {
        Self {
            executor,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: RunMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run every task once and wait for all of them
    pub async fn run_all(&self, tasks: Vec<Task>) -> Result<AggregateResult, AggregationFault> {
        self.run_all_with_cancel(tasks, CancellationToken::new())
            .await
    }

    /// Like [`run_all`](Self::run_all); cancelling `cancel` ends every unfinished
    /// task with a `Cancelled` outcome
    pub async fn run_all_with_cancel(
        &self,
        tasks: Vec<Task>,
        cancel: CancellationToken,
    ) -> Result<AggregateResult, AggregationFault> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, tasks = tasks.len());

        async move {
            let start = Instant::now();
            info!("Starting run of {} task(s)", tasks.len());

            let names: Vec<String> = tasks.iter().map(|t| t.name().to_string()).collect();
            let mut units = JoinSet::new();

            for (index, task) in tasks.into_iter().enumerate() {
                let executor = Arc::clone(&self.executor);
                let deadline = self.config.task_timeout;
                let cancel = cancel.clone();
                if let Some(metrics) = &self.metrics {
                    metrics.task_started();
                }

                units.spawn(
                    async move {
                        let outcome = run_unit(executor, &task, deadline, cancel).await;
                        (index, outcome)
                    }
                    .in_current_span(),
                );
            }

            let mut slots: Vec<Option<TaskOutcome>> = vec![None; names.len()];
            let mut collected = 0;
            while let Some(joined) = units.join_next().await {
                let (index, outcome) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        error!("Task unit failed to report: {}", e);
                        // Dropping the set aborts the remaining units and closes their sessions
                        if let Some(metrics) = &self.metrics {
                            metrics.tasks_abandoned(names.len() - collected);
                        }
                        return Err(AggregationFault::Join(e));
                    }
                };
                if let Some(metrics) = &self.metrics {
                    metrics.record_outcome(&outcome);
                }
                slots[index] = Some(outcome);
                collected += 1;
            }

            let outcomes = slots
                .into_iter()
                .zip(names)
                .map(|(slot, task)| slot.ok_or(AggregationFault::MissingOutcome { task }))
                .collect::<Result<Vec<_>, _>>()?;

            let result = AggregateResult {
                run_id,
                outcomes,
                duration: start.elapsed(),
            };

            if let Some(metrics) = &self.metrics {
                metrics.record_run(&result);
            }

            info!(
                "Run finished in {:?}: {} succeeded, {} failed",
                result.duration,
                result.success_count(),
                result.failure_count()
            );

            Ok(result)
        }
        .instrument(span)
        .await
    }
}

/// One unit of work: execute under the deadline, or give way to cancellation
///
/// Writes the task's single progress line once the final outcome is known.
async fn run_unit(
    executor: Arc<dyn Executor>,
    task: &Task,
    deadline: Option<Duration>,
    cancel: CancellationToken,
) -> TaskOutcome {
    let started_at = Utc::now();
    let start = Instant::now();

    let execution = async {
        match deadline {
            Some(limit) => match tokio::time::timeout(limit, executor.execute(task)).await {
                Ok(outcome) => outcome,
                Err(_) => TaskOutcome::failed(
                    task,
                    FailureKind::Timeout,
                    format!("timed out after {:?}", limit),
                    started_at,
                    start.elapsed(),
                ),
            },
            None => executor.execute(task).await,
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => TaskOutcome::failed(
            task,
            FailureKind::Cancelled,
            "run cancelled before the task finished",
            started_at,
            start.elapsed(),
        ),
        outcome = execution => outcome,
    };

    report_progress(&outcome);
    outcome
}

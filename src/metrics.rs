//! Prometheus metrics for playbook runs
//!
//! # Available Metrics
//!
//! - `eagledeploy_task_outcomes_total{status, failure}` - Counter of finished tasks
//! - `eagledeploy_task_duration_seconds{status}` - Histogram of task durations
//! - `eagledeploy_active_tasks` - Gauge of tasks currently in flight
//! - `eagledeploy_runs_total{status}` - Counter of completed runs
//!
//! Metrics are rendered in the text exposition format; the CLI writes them to
//! a file for node_exporter's textfile collector or similar.

use crate::error::Result;
use crate::models::{AggregateResult, TaskOutcome};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Histogram bucket boundaries for task duration metrics (in seconds)
const TASK_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Metrics registry for task and run outcomes
#[derive(Clone)]
pub struct RunMetrics {
    registry: Registry,
    task_outcomes: IntCounterVec,
    task_duration: HistogramVec,
    active_tasks: IntGauge,
    runs: IntCounterVec,
}

impl RunMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let task_outcomes = IntCounterVec::new(
            Opts::new(
                "eagledeploy_task_outcomes_total",
                "Total number of finished tasks",
            ),
            &["status", "failure"],
        )?;

        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "eagledeploy_task_duration_seconds",
                "Task execution duration in seconds",
            )
            .buckets(TASK_DURATION_BUCKETS.to_vec()),
            &["status"],
        )?;

        let active_tasks = IntGauge::with_opts(Opts::new(
            "eagledeploy_active_tasks",
            "Tasks currently in flight",
        ))?;

        let runs = IntCounterVec::new(
            Opts::new("eagledeploy_runs_total", "Total number of completed runs"),
            &["status"],
        )?;

        registry.register(Box::new(task_outcomes.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(active_tasks.clone()))?;
        registry.register(Box::new(runs.clone()))?;

        Ok(Self {
            registry,
            task_outcomes,
            task_duration,
            active_tasks,
            runs,
        })
    }

    pub fn task_started(&self) {
        self.active_tasks.inc();
    }

    pub fn record_outcome(&self, outcome: &TaskOutcome) {
        let status = outcome.status.to_string();
        let failure = outcome
            .failure
            .map(|f| f.to_string())
            .unwrap_or_else(|| "none".to_string());

        self.active_tasks.dec();
        self.task_outcomes
            .with_label_values(&[status.as_str(), failure.as_str()])
            .inc();
        self.task_duration
            .with_label_values(&[status.as_str()])
            .observe(outcome.duration.as_secs_f64());
    }

    /// Units that will never report an outcome leave the gauge
    pub fn tasks_abandoned(&self, count: usize) {
        self.active_tasks.sub(count as i64);
    }

    pub fn record_run(&self, result: &AggregateResult) {
        let status = if result.is_success() {
            "succeeded"
        } else {
            "failed"
        };
        self.runs.with_label_values(&[status]).inc();
    }

    pub fn active_tasks(&self) -> i64 {
        self.active_tasks.get()
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

//! Retry with exponential backoff, layered around an [`Executor`]
//!
//! The scheduler makes exactly one call per task. Retrying is a decorator:
//! wrap the executor in a [`RetryExecutor`] and each of those calls may make
//! several attempts, sleeping between them.
//!
//! # Example
//!
//! ```no_run
//! use eagledeploy::executor::TaskExecutor;
//! use eagledeploy::retry::{RetryConfig, RetryExecutor};
//! use eagledeploy::session::DefaultSessionFactory;
//! # use eagledeploy::session::{host_key::AcceptAnyHost, SshOptions};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # let ssh = SshOptions::new(Duration::from_secs(10), Arc::new(AcceptAnyHost));
//! let executor = TaskExecutor::new(Arc::new(DefaultSessionFactory::new(ssh)));
//! let config = RetryConfig::new(3, Duration::from_secs(1), Duration::from_secs(60));
//! let retrying = RetryExecutor::new(executor, config);
//! ```

use crate::executor::Executor;
use crate::models::{Task, TaskOutcome};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration for task execution
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including initial attempt)
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay cap to prevent excessive waiting
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Create a new retry configuration
    ///
    /// # Arguments
    ///
    /// * `max_retries` - Maximum number of retry attempts (not including initial)
    /// * `base_delay` - Base delay for exponential backoff (e.g., 1 second)
    /// * `max_delay` - Maximum delay cap (e.g., 60 seconds)
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::new(0, Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Retry state tracking for one task
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Current attempt number (starts at 1 for first attempt)
    pub attempt: u32,
    /// Number of retries performed (0 for first attempt)
    pub retry_count: u32,
}

impl RetryState {
    /// Create a new retry state (starts at attempt 1)
    pub fn new() -> Self {
        Self {
            attempt: 1,
            retry_count: 0,
        }
    }

    /// Returns `true` if we haven't exceeded max retries
    pub fn should_retry(&self, config: &RetryConfig) -> bool {
        self.retry_count < config.max_retries
    }

    /// Backoff before the next attempt: `base_delay * 2^retry_count`, capped at `max_delay`
    pub fn calculate_delay(&self, config: &RetryConfig) -> Duration {
        let factor = 2u32.saturating_pow(self.retry_count);
        let delay = config.base_delay.saturating_mul(factor).min(config.max_delay);

        debug!(
            "Calculated backoff delay: {:?} (attempt {}, retry {})",
            delay, self.attempt, self.retry_count
        );

        delay
    }

    /// Record a retry attempt, incrementing counters
    pub fn record_retry(&mut self) {
        self.retry_count += 1;
        self.attempt += 1;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Decorator adding bounded retries to any executor
pub struct RetryExecutor<E> {
    inner: E,
    config: RetryConfig,
}

impl<E: Executor> RetryExecutor<E> {
    pub fn new(inner: E, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<E: Executor> Executor for RetryExecutor<E> {
    async fn execute(&self, task: &Task) -> TaskOutcome {
        let mut state = RetryState::new();

        loop {
            let outcome = self.inner.execute(task).await;

            let retryable = outcome.failure.map(|f| f.is_retryable()).unwrap_or(false);
            if outcome.is_success() || !retryable || !state.should_retry(&self.config) {
                return outcome.with_attempts(state.attempt);
            }

            let delay = state.calculate_delay(&self.config);
            warn!(
                "Task '{}' will retry in {:?} (attempt {}/{})",
                task.name(),
                delay,
                state.attempt + 1,
                self.config.max_retries + 1
            );
            tokio::time::sleep(delay).await;
            state.record_retry();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CapturedOutput, FailureKind};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with `kind` until `succeed_on` attempts have been made
    struct Flaky {
        calls: AtomicU32,
        succeed_on: u32,
        kind: FailureKind,
    }

    impl Flaky {
        fn new(succeed_on: u32, kind: FailureKind) -> Self {
            Self {
                calls: AtomicU32::new(0),
                succeed_on,
                kind,
            }
        }
    }

    #[async_trait]
    impl Executor for Flaky {
        async fn execute(&self, task: &Task) -> TaskOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                let captured = CapturedOutput {
                    output: "ok".to_string(),
                    exit_code: 0,
                    truncated: false,
                };
                TaskOutcome::succeeded(task, captured, Utc::now(), Duration::ZERO)
            } else {
                TaskOutcome::failed(task, self.kind, "flaky", Utc::now(), Duration::ZERO)
            }
        }
    }

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert_eq!(RetryConfig::none().max_retries, 0);
    }

    #[test]
    fn test_should_retry() {
        let config = RetryConfig::new(2, Duration::from_secs(1), Duration::from_secs(60));
        let mut state = RetryState::new();

        assert!(state.should_retry(&config));
        state.record_retry();
        assert!(state.should_retry(&config));
        state.record_retry();
        assert!(!state.should_retry(&config));
        assert_eq!(state.attempt, 3);
    }

    #[test]
    fn test_calculate_delay() {
        let config = RetryConfig::new(10, Duration::from_millis(500), Duration::from_secs(5));
        let mut state = RetryState::new();

        assert_eq!(state.calculate_delay(&config), Duration::from_millis(500));
        state.record_retry();
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(1));
        state.record_retry();
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(2));
        state.record_retry();
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(4));
        state.record_retry();
        // 8s capped at 5s
        assert_eq!(state.calculate_delay(&config), Duration::from_secs(5));
    }

    #[test]
    fn test_overflow_protection() {
        let config = RetryConfig::new(100, Duration::from_secs(1), Duration::from_secs(3600));
        let mut state = RetryState::new();
        state.retry_count = 100;

        assert_eq!(state.calculate_delay(&config), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let executor = RetryExecutor::new(Flaky::new(3, FailureKind::Connect), fast(5));
        let outcome = executor.execute(&Task::local("t", "true")).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let executor = RetryExecutor::new(Flaky::new(10, FailureKind::NonZeroExit), fast(2));
        let outcome = executor.execute(&Task::local("t", "false")).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(executor.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_task_not_retried() {
        let executor = RetryExecutor::new(Flaky::new(10, FailureKind::InvalidTask), fast(5));
        let outcome = executor.execute(&Task::local("t", "")).await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(executor.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_first_time_is_one_attempt() {
        let executor = RetryExecutor::new(Flaky::new(1, FailureKind::Run), fast(5));
        let outcome = executor.execute(&Task::local("t", "true")).await;
        assert_eq!(outcome.attempts, 1);
    }
}

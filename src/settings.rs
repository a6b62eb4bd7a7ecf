//! Layered runtime settings
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. `eagledeploy.{toml,yaml,json}` in the working directory, or the file
//!    passed with `--config` (which must exist)
//! 3. `EAGLEDEPLOY_*` environment variables, e.g. `EAGLEDEPLOY_TASK_TIMEOUT_SECS=60`
//!
//! Playbook `settings:` and CLI flags are applied on top by the caller.

use crate::error::Result;
use crate::playbook::PlaybookSettings;
use crate::retry::RetryConfig;
use crate::session::host_key::{build_verifier, HostKeyPolicy};
use crate::session::SshOptions;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_NAME: &str = "eagledeploy";
const ENV_PREFIX: &str = "EAGLEDEPLOY";

/// Effective settings for one invocation
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Settings {
    /// Deployment port for tasks that do not set their own
    pub port: u16,
    pub connect_timeout_secs: u64,
    /// Deadline for each attempt of a task; 0 disables it
    pub task_timeout_secs: u64,
    pub retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub host_key_policy: HostKeyPolicy,
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout_secs: 10,
            task_timeout_secs: 300,
            retries: 0,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            host_key_policy: HostKeyPolicy::Strict,
            known_hosts: None,
        }
    }
}

impl Settings {
    /// Load defaults, then the config file, then the environment
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let defaults = Settings::default();

        let mut builder = Config::builder()
            .set_default("port", i64::from(defaults.port))?
            .set_default("connect_timeout_secs", defaults.connect_timeout_secs as i64)?
            .set_default("task_timeout_secs", defaults.task_timeout_secs as i64)?
            .set_default("retries", i64::from(defaults.retries))?
            .set_default("retry_base_delay_ms", defaults.retry_base_delay_ms as i64)?
            .set_default("retry_max_delay_ms", defaults.retry_max_delay_ms as i64)?
            .set_default("host_key_policy", "strict")?;

        builder = match config_file {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_NAME).required(false)),
        };

        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        Ok(settings)
    }

    /// Apply a playbook's own `settings:` block
    pub fn apply_playbook(&mut self, overrides: &PlaybookSettings) {
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(timeout) = overrides.timeout {
            self.task_timeout_secs = timeout;
        }
        if let Some(retries) = overrides.retries {
            self.retries = retries;
        }
    }

    /// Per-attempt deadline for the task executor, so a timed out attempt can be retried
    pub fn attempt_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.retries,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions::new(
            Duration::from_secs(self.connect_timeout_secs),
            build_verifier(self.host_key_policy, self.known_hosts.as_deref()),
        )
    }
}

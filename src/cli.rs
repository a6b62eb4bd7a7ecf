//! CLI interface for EagleDeploy

use crate::executor::{Executor, TaskExecutor};
use crate::logging::{init_logging, LogConfig};
use crate::metrics::RunMetrics;
use crate::models::AggregateResult;
use crate::playbook::{
    filter_hosts, list_playbooks, load_playbook_file, parse_host_list, LoadOptions,
};
use crate::retry::RetryExecutor;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::session::{DefaultSessionFactory, HostKeyPolicy};
use crate::settings::Settings;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// EagleDeploy - run deployment playbooks against many hosts in parallel
#[derive(Parser, Debug)]
#[command(name = "eagledeploy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run deployment playbooks against many hosts over SSH, in parallel", long_about = None)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: String,

    /// Settings file (defaults to ./eagledeploy.{toml,yaml} when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute every task of a playbook concurrently
    Run(RunArgs),

    /// Load a playbook and print the resolved task list without running it
    Validate {
        /// Path to playbook YAML file
        playbook: PathBuf,

        /// Only keep tasks targeting these hosts (comma separated)
        #[arg(long)]
        hosts: Option<String>,
    },

    /// List playbook files
    List {
        /// Only show playbooks whose path contains this keyword
        keyword: Option<String>,

        /// Directory to search
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to playbook YAML file
    pub playbook: PathBuf,

    /// Only run tasks targeting these hosts (comma separated)
    #[arg(long)]
    pub hosts: Option<String>,

    /// Timeout for each attempt of a task, in seconds (0 disables)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Retries per task after a failed attempt
    #[arg(long)]
    pub retries: Option<u32>,

    /// SSH port for every remote task
    #[arg(short, long)]
    pub port: Option<u16>,

    /// known_hosts file used to verify host keys
    #[arg(long)]
    pub known_hosts: Option<PathBuf>,

    /// Skip host key verification
    #[arg(long)]
    pub insecure_accept_any_host_key: bool,

    /// Print outcomes as JSON
    #[arg(long)]
    pub json: bool,

    /// Write Prometheus metrics to this file after the run
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        init_logging(&LogConfig::from_flags(&self.log_level, &self.log_format))
    }

    /// Execute the CLI command
    pub async fn execute(&self) -> anyhow::Result<ExitCode> {
        match &self.command {
            Commands::Run(args) => self.run_playbook(args).await,
            Commands::Validate { playbook, hosts } => {
                self.validate_playbook(playbook, hosts.as_deref())?;
                Ok(ExitCode::SUCCESS)
            }
            Commands::List { keyword, dir } => {
                list(dir, keyword.as_deref().unwrap_or(""))?;
                Ok(ExitCode::SUCCESS)
            }
        }
    }

    /// Run a playbook once; exit status 1 when any task failed
    async fn run_playbook(&self, args: &RunArgs) -> anyhow::Result<ExitCode> {
        info!("Loading playbook from: {:?}", args.playbook);

        let mut settings = Settings::load(self.config.as_deref())?;
        let options = LoadOptions {
            default_port: settings.port,
            port_override: args.port,
        };
        let playbook = load_playbook_file(&args.playbook, &options)?;
        settings.apply_playbook(&playbook.settings);
        apply_run_flags(&mut settings, args);

        let hosts = args.hosts.as_deref().map(parse_host_list).unwrap_or_default();
        let tasks = filter_hosts(playbook.tasks, &hosts)?;
        info!(
            "Playbook '{}' loaded: {} task(s)",
            playbook.name.as_deref().unwrap_or("unnamed"),
            tasks.len()
        );

        let factory = Arc::new(DefaultSessionFactory::new(settings.ssh_options()));
        let executor: Arc<dyn Executor> = Arc::new(RetryExecutor::new(
            TaskExecutor::new(factory).with_timeout(settings.attempt_timeout()),
            settings.retry_config(),
        ));
        let metrics = RunMetrics::new()?;
        let scheduler =
            Scheduler::new(executor, SchedulerConfig::default()).with_metrics(metrics.clone());

        let cancel = CancellationToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling unfinished tasks");
                    cancel.cancel();
                }
            })
        };

        let result = scheduler.run_all_with_cancel(tasks, cancel).await;
        interrupt.abort();
        let result = result?;

        if args.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            print_report(&result);
        }

        if let Some(path) = &args.metrics_file {
            std::fs::write(path, metrics.render()?)?;
            info!("Metrics written to {:?}", path);
        }

        if result.is_success() {
            info!("Playbook completed successfully");
            Ok(ExitCode::SUCCESS)
        } else {
            error!("{} of {} task(s) failed", result.failure_count(), result.len());
            Ok(ExitCode::from(1))
        }
    }

    /// Validate a playbook without executing
    fn validate_playbook(&self, path: &Path, hosts: Option<&str>) -> anyhow::Result<()> {
        info!("Validating playbook: {:?}", path);

        let settings = Settings::load(self.config.as_deref())?;
        let options = LoadOptions {
            default_port: settings.port,
            port_override: None,
        };
        let playbook = load_playbook_file(path, &options)?;
        let hosts = hosts.map(parse_host_list).unwrap_or_default();
        let tasks = filter_hosts(playbook.tasks, &hosts)?;

        println!(
            "Playbook '{}' is valid",
            playbook.name.as_deref().unwrap_or_else(|| path.to_str().unwrap_or("?"))
        );
        if let Some(version) = &playbook.version {
            println!("Version: {}", version);
        }
        println!("Tasks: {}", tasks.len());
        for task in &tasks {
            let target = task
                .target()
                .map(ToString::to_string)
                .unwrap_or_else(|| "local".to_string());
            let user = task
                .credential()
                .map(|c| c.username.as_str())
                .unwrap_or("-");
            println!("  {:<30} {:<28} {:<12} {}", task.name(), target, user, task.command());
        }

        Ok(())
    }
}

/// CLI flags take precedence over file, environment and playbook settings
fn apply_run_flags(settings: &mut Settings, args: &RunArgs) {
    if let Some(timeout) = args.timeout {
        settings.task_timeout_secs = timeout;
    }
    if let Some(retries) = args.retries {
        settings.retries = retries;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(path) = &args.known_hosts {
        settings.known_hosts = Some(path.clone());
    }
    if args.insecure_accept_any_host_key {
        settings.host_key_policy = HostKeyPolicy::AcceptAny;
    }
}

fn print_report(result: &AggregateResult) {
    for outcome in &result.outcomes {
        println!("{}", outcome.summary_line());
    }
    println!();
    println!(
        "{} task(s): {} succeeded, {} failed in {:.2}s",
        result.len(),
        result.success_count(),
        result.failure_count(),
        result.duration.as_secs_f64()
    );
}

fn list(dir: &Path, keyword: &str) -> anyhow::Result<()> {
    let found = list_playbooks(dir, keyword)?;
    if found.is_empty() {
        println!("No playbooks found in {}", dir.display());
        return Ok(());
    }
    for path in found {
        println!("{}", path.display());
    }
    Ok(())
}

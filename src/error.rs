//! Error types for EagleDeploy

use thiserror::Error;

/// Crate-level error types (loading, configuration, I/O)
#[derive(Error, Debug)]
pub enum EagleError {
    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// Playbook YAML exceeded size limit
    #[error("Playbook YAML exceeds 1MB limit (size: {0} bytes)")]
    YamlSizeExceeded(usize),

    /// Task count exceeded limit
    #[error("Task count {count} exceeds limit of {limit}")]
    TaskCountExceeded { count: usize, limit: usize },

    /// Task definition is unusable
    #[error("Invalid task '{name}': {reason}")]
    InvalidTask { name: String, reason: String },

    /// Remote task without usable credentials
    #[error("Task '{task}' targets a remote host but has no {missing}")]
    MissingCredential { task: String, missing: &'static str },

    /// Host filter matched nothing
    #[error("No tasks target any of the requested hosts: {0}")]
    NoMatchingHosts(String),

    /// Settings could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A run could not be aggregated
    #[error(transparent)]
    Aggregation(#[from] AggregationFault),
}

/// Failure to bring a session into the connected state
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("failed to resolve {endpoint}: {source}")]
    Resolve {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {endpoint}: {message}")]
    Unreachable { endpoint: String, message: String },

    #[error("SSH handshake with {endpoint} failed: {message}")]
    Handshake { endpoint: String, message: String },

    #[error("host key for {endpoint} rejected: {reason}")]
    HostKeyRejected { endpoint: String, reason: String },

    #[error("authentication as '{user}' on {endpoint} failed: {message}")]
    AuthRejected {
        endpoint: String,
        user: String,
        message: String,
    },

    /// Sessions are single use
    #[error("session for {endpoint} has already been opened")]
    AlreadyOpened { endpoint: String },
}

/// Failure to run a command on a connected session
///
/// A command that runs and exits non-zero is not a `RunError`; its exit code
/// travels inside [`CapturedOutput`](crate::models::CapturedOutput).
#[derive(Error, Debug)]
pub enum RunError {
    #[error("session is not connected")]
    NotConnected,

    #[error("failed to open channel: {0}")]
    Channel(String),

    #[error("failed to start command: {0}")]
    Exec(String),

    #[error("failed to read command output: {0}")]
    Read(String),

    #[error("failed to retrieve exit status: {0}")]
    ExitStatus(String),

    #[error("session worker failed: {0}")]
    Worker(String),

    #[error("local process error: {0}")]
    Io(#[from] std::io::Error),
}

/// The scheduler lost track of a unit of work; fatal to the whole run
#[derive(Error, Debug)]
pub enum AggregationFault {
    #[error("task unit failed to report: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("no outcome collected for task '{task}'")]
    MissingOutcome { task: String },
}

/// Result type alias using EagleError
pub type Result<T> = std::result::Result<T, EagleError>;

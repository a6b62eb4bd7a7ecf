//! Log output for the CLI
//!
//! Everything goes to stderr; stdout carries only the run report. In JSON mode
//! each event embeds the fields of the span it was emitted in, so every line
//! written during a run carries that run's `run_id`.

use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::FmtSubscriber;

/// Shape of each log line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers
    Json,
    /// Compact single-line text
    #[default]
    Pretty,
}

impl LogFormat {
    /// `json` (any case) selects JSON, anything else the text format
    pub fn parse(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Map a `--log-level` value to a tracing level; unknown names mean info
pub fn parse_level(name: &str) -> Level {
    match name.to_ascii_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
}

impl LogConfig {
    pub fn from_flags(level: &str, format: &str) -> Self {
        Self {
            level: parse_level(level),
            format: LogFormat::parse(format),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
        }
    }
}

/// Subscriber for `config` writing through `writer`
///
/// Span open and close events are not logged: a run span lives as long as the
/// run and its closing carries nothing the final summary line does not.
fn build_subscriber<W>(config: &LogConfig, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = FmtSubscriber::builder()
        .with_max_level(config.level)
        .with_writer(writer);

    match config.format {
        LogFormat::Json => Box::new(
            builder
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .finish(),
        ),
        LogFormat::Pretty => Box::new(builder.compact().with_target(false).finish()),
    }
}

/// Install the process-wide subscriber; call once, before anything logs
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    tracing::subscriber::set_global_default(build_subscriber(config, std::io::stderr))?;
    Ok(())
}

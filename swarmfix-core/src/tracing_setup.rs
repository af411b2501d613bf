//! Tracing setup for swarmfix
//!
//! Scenario runs log twice: the console shows what the operator asked for,
//! while a trace file keeps every event of the last run so a failed transfer
//! can be replayed line by line afterwards.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::{Level, Subscriber};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the trace file written below the logs directory.
pub const LOG_FILE_NAME: &str = "swarmfix-last-run.log";

/// Logs directory used when the caller does not pick one.
pub const DEFAULT_LOGS_DIR: &str = "logs";

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Cannot prepare trace file: {0}")]
    TraceFile(#[from] std::io::Error),

    #[error("Global subscriber already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Path of the trace file for `logs_dir`, or the default directory.
pub fn trace_file_path(logs_dir: Option<&Path>) -> PathBuf {
    logs_dir
        .unwrap_or_else(|| Path::new(DEFAULT_LOGS_DIR))
        .join(LOG_FILE_NAME)
}

fn console_layer<S>(level: Level) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    // RUST_LOG wins over the level chosen on the command line
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(filter)
}

pub(crate) fn trace_file_layer<S>(file: File) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(file)
        .with_filter(EnvFilter::new("trace"))
}

/// Installs the global subscriber: console at `console_level`, full trace
/// to [`LOG_FILE_NAME`] below `logs_dir` (default `./logs`).
///
/// The trace file is truncated, so it only ever holds the latest run.
///
/// # Errors
///
/// - `TracingError::TraceFile` - Logs directory or trace file cannot be created
/// - `TracingError::AlreadyInstalled` - Another global subscriber is active
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> Result<PathBuf, TracingError> {
    let path = trace_file_path(logs_dir);
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let file = File::create(&path)?;

    tracing_subscriber::registry()
        .with(console_layer(console_level))
        .with(trace_file_layer(file))
        .try_init()?;

    tracing::info!("Console at {}, full trace in {}", console_level, path.display());
    Ok(path)
}

/// Installs a subscriber writing through the test harness capture.
///
/// Safe to call from every test; only the first call in a process installs
/// anything. Honors `RUST_LOG`, defaulting to `info`.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Console verbosity accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    /// Everything, including per-event replay logging
    Trace,
}

impl CliLogLevel {
    /// Converts CLI log level to tracing Level enum.
    ///
    /// # Examples
    /// ```
    /// use swarmfix_core::tracing_setup::CliLogLevel;
    ///
    /// let level = CliLogLevel::Info.as_tracing_level();
    /// assert_eq!(level, tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        Level::from(self)
    }
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_tracing_level().as_str().to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_cli_levels_map_to_tracing_levels() {
        assert_eq!(CliLogLevel::Error.as_tracing_level(), Level::ERROR);
        assert_eq!(Level::from(CliLogLevel::Trace), Level::TRACE);
        assert_eq!(CliLogLevel::Warn.to_string(), "warn");
    }

    #[test]
    fn test_trace_file_path_defaults_to_logs_dir() {
        assert_eq!(trace_file_path(None), Path::new("logs").join(LOG_FILE_NAME));

        let temp_dir = TempDir::new().unwrap();
        assert_eq!(
            trace_file_path(Some(temp_dir.path())),
            temp_dir.path().join(LOG_FILE_NAME)
        );
    }

    #[test]
    fn test_trace_file_layer_records_debug_events() {
        let temp_dir = TempDir::new().unwrap();
        let path = trace_file_path(Some(temp_dir.path()));
        let file = File::create(&path).unwrap();

        let subscriber = tracing_subscriber::registry().with(trace_file_layer(file));
        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("piece 3 finished");
        });

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("piece 3 finished"));
        assert!(written.contains("DEBUG"));
    }

    #[test]
    fn test_init_test_tracing_is_idempotent() {
        init_test_tracing();
        init_test_tracing();
        tracing::info!("still logging");
    }
}

//! Tracing setup for Undertow
//!
//! Console output at the level the user picks, plus an optional full trace
//! log of the last run on disk for post-mortem debugging of swarm behaviour.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the per-run trace log inside the logs directory.
pub const LOG_FILE_NAME: &str = "undertow-last-run.log";

/// Initialize tracing with console output and, when `logs_dir` is given, a
/// trace-level file log.
///
/// The console honours `RUST_LOG` when set, otherwise `console_level`. The
/// file at `<logs_dir>/undertow-last-run.log` is overwritten on every run.
/// Returns the log file path when one was created.
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - Logs directory or file cannot be created,
///   or a global subscriber is already installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<Option<PathBuf>, Box<dyn std::error::Error>> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_filter(console_filter);

    let Some(logs_path) = logs_dir else {
        tracing_subscriber::registry().with(console_layer).try_init()?;
        tracing::info!("init_tracing: console={console_level}");
        return Ok(None);
    };

    create_dir_all(logs_path)?;
    let log_file_path = logs_path.join(LOG_FILE_NAME);
    let log_file = File::create(&log_file_path)?;

    let file_layer = fmt::layer()
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "init_tracing: console={console_level} trace_file={}",
        log_file_path.display()
    );

    Ok(Some(log_file_path))
}

/// Console verbosity selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    /// Lifecycle: torrents added, peers connected, readiness changes
    Info,
    /// Scheduling decisions and discovery results
    Debug,
    /// Per-block flow
    Trace,
}

impl CliLogLevel {
    /// # Examples
    /// ```
    /// use undertow_core::tracing_setup::CliLogLevel;
    ///
    /// assert_eq!(CliLogLevel::Debug.as_tracing_level(), tracing::Level::DEBUG);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            Self::Error => Level::ERROR,
            Self::Warn => Level::WARN,
            Self::Info => Level::INFO,
            Self::Debug => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }
}

impl std::str::FromStr for CliLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as clap::ValueEnum>::from_str(s, true).map_err(|_| format!("Invalid log level: {s}"))
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = self.as_tracing_level().to_string().to_lowercase();
        f.write_str(&level)
    }
}

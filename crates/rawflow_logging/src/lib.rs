//! Shared logging setup for rawflow binaries (sentinel, plugin hosts).
//!
//! Every process logs to two sinks: a size-rotated file under
//! `$RAWFLOW_HOME/logs/<app>.log` and stderr. `RUST_LOG` overrides the
//! default filter for both.

mod rolling;

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub use rolling::RollingWriter;

const DEFAULT_LOG_FILTER: &str =
    "rawflow=info,rawflow_sentinel=info,rawflow_collector=info,rawflow_plugin=info";
const VERBOSE_LOG_FILTER: &str =
    "rawflow=debug,rawflow_sentinel=debug,rawflow_collector=debug,rawflow_plugin=debug";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for one binary.
pub struct LogConfig<'a> {
    /// Base name of the log file (`<app_name>.log`)
    pub app_name: &'a str,
    /// Lower the default filter to debug when `RUST_LOG` is unset
    pub verbose: bool,
}

/// Install the global tracing subscriber.
///
/// Fails if the home directory cannot be resolved or the log file cannot be
/// opened. Calling it twice in one process panics inside `tracing_subscriber`,
/// so binaries call it exactly once from `main`.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = RollingWriter::open(log_dir, config.app_name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
        .with_context(|| format!("Failed to open log file for {}", config.app_name))?;

    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if config.verbose {
                VERBOSE_LOG_FILTER
            } else {
                DEFAULT_LOG_FILTER
            })
        })
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter()),
        )
        .init();

    Ok(())
}

/// Rawflow home directory: `$RAWFLOW_HOME`, or `~/.rawflow`.
pub fn rawflow_home() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var("RAWFLOW_HOME") {
        return Ok(PathBuf::from(override_path));
    }
    dirs::home_dir()
        .map(|home| home.join(".rawflow"))
        .context("Could not determine home directory; set RAWFLOW_HOME")
}

/// Logs directory: `<home>/logs`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(rawflow_home()?.join("logs"))
}

/// Ensure the logs directory exists and return it.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir()?;
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

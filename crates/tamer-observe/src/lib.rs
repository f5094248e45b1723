//! Process-wide tracing setup.

use anyhow::{Context, Result, anyhow};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "TAMER_LOG";
pub const LOG_FILE: &str = "tamer.log";

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    /// Mirror log lines on stderr.
    pub verbose: bool,
    /// Lower the default level to `debug`.
    pub debug: bool,
}

/// Filter from `TAMER_LOG`, then `RUST_LOG`, then the default level.
fn env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)))
}

fn default_directive(debug: bool) -> &'static str {
    if debug { "debug" } else { "info" }
}

/// Log to `<log_dir>/tamer.log`, and to stderr as well when verbose.
/// Fails when the log file cannot be opened or a subscriber is already set.
pub fn init_logging(log_dir: &Path, options: LogOptions) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let path = log_dir.join(LOG_FILE);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    let stderr_layer = options
        .verbose
        .then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));
    tracing_subscriber::registry()
        .with(env_filter(options.debug))
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false),
        )
        .with(stderr_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {e}"))?;
    Ok(path)
}

/// Stderr-only logging, used when the log file is unavailable. Only warnings
/// are shown unless verbose.
pub fn init_stderr_logging(options: LogOptions) {
    let filter = if options.verbose {
        env_filter(options.debug)
    } else {
        EnvFilter::new("warn")
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

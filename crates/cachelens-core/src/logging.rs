//! Logging infrastructure for cachelens.
//!
//! This module provides structured logging using the `tracing` ecosystem.
//!
//! ## Features
//!
//! - JSON lines format for machine parsing
//! - File output to `~/.cachelens/logs/cachelens.log`
//! - Console output with configurable verbosity
//!
//! ## Example
//!
//! ```no_run
//! use cachelens_core::logging;
//!
//! let _guard = logging::init_logging(None, false).expect("logging init");
//!
//! tracing::info!("cachelens started");
//! tracing::debug!(model = "claude-sonnet-4-5", "usage extracted");
//! ```

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{CacheLensError, Result};

/// Guard that must be held to ensure log flushing on shutdown.
///
/// When this guard is dropped, it flushes any pending log entries.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Log targets enabled by default: the event macros plus every workspace crate.
const LOG_TARGETS: &[&str] = &[
    "cachelens",
    "cachelens_core",
    "cachelens_cost",
    "cachelens_stream",
    "cachelens_diagnosis",
    "cachelens_session",
];

/// Initialize the cachelens logging system.
///
/// This sets up:
/// - File logging to `~/.cachelens/logs/cachelens.log` (JSON lines format)
/// - Console logging to stderr (human-readable format)
///
/// # Arguments
///
/// * `log_dir` - Optional custom log directory. Defaults to `~/.cachelens/logs/`
/// * `verbose` - If true, sets log level to DEBUG. Otherwise uses INFO.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    let log_dir = match log_dir {
        Some(dir) => dir,
        None => default_log_dir()?,
    };

    std::fs::create_dir_all(&log_dir).map_err(|e| CacheLensError::DirectoryCreation {
        path: log_dir.clone(),
        source: e,
    })?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "cachelens.log");
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives: Vec<String> = LOG_TARGETS
            .iter()
            .map(|target| format!("{target}={default_level}"))
            .collect();
        EnvFilter::new(directives.join(","))
    });

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_span_list(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    tracing::debug!(log_dir = %log_dir.display(), verbose, "logging initialized");

    Ok(LogGuard {
        _file_guard: Some(file_guard),
    })
}

/// Initialize minimal console-only logging for testing.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Get the cachelens home directory (`~/.cachelens`).
pub fn cachelens_home() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| CacheLensError::Internal {
        message: "could not determine home directory".into(),
    })?;

    Ok(home.join(".cachelens"))
}

/// Get the default log directory path.
///
/// Returns `~/.cachelens/logs/`
pub fn default_log_dir() -> Result<PathBuf> {
    Ok(cachelens_home()?.join("logs"))
}

/// Convenience macro for logging processed usage records.
///
/// # Example
///
/// ```ignore
/// log_usage_event!(model = "claude-sonnet-4-5", cache_read = 1200, outcome = "hit");
/// ```
#[macro_export]
macro_rules! log_usage_event {
    ($($field:tt)*) => {
        tracing::info!(
            target: "cachelens::usage",
            $($field)*,
            "usage event"
        )
    };
}

/// Convenience macro for logging miss diagnoses.
///
/// # Example
///
/// ```ignore
/// log_diagnosis_event!(reasons = 2, location = "late");
/// ```
#[macro_export]
macro_rules! log_diagnosis_event {
    ($($field:tt)*) => {
        tracing::info!(
            target: "cachelens::diagnosis",
            $($field)*,
            "diagnosis event"
        )
    };
}

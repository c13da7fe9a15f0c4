//! Logging for the `berth` binary.
//!
//! Log lines go to stderr and never mix with command output on stdout.
//! `--log-file` adds a plain-text copy, written off the async runtime.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter used when `RUST_LOG` is unset.
fn default_directive(debug: bool) -> &'static str {
    if debug || cfg!(debug_assertions) {
        "berth=debug"
    } else {
        "berth=warn"
    }
}

/// Install the global subscriber.
///
/// Hold the returned guard until exit; dropping it flushes the log file.
pub fn setup_logging(debug: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(debug);

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(filter)
            .init();
        return Ok(None);
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(filter)
        .init();

    Ok(Some(guard))
}

//! Logging configuration and initialization.
//!
//! This module handles setting up the `tracing` subscriber, potentially
//! directing logs to a file instead of stderr.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
///
/// With a `log_dir`, logs are written to daily files there. Otherwise they
/// go to stderr, keeping stdout free for tool output.
///
/// Returns an optional `WorkerGuard`. This guard MUST be held for the
/// duration of the program (e.g., assigned to a variable in `main`). If
/// dropped, log flushing may not complete.
pub fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(dir) = log_dir {
        // Rolling file appender that rotates daily.
        let file_appender = rolling::daily(dir, "vulnreach.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
            .init();

        Some(guard)
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();

        None
    }
}

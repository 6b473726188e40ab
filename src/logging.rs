//! Structured JSON logging to `LOG_FILE` plus stdout (spec §6, "Logging
//! (external)"). Mirrors the teacher's `tracing-appender` setup, swapping
//! the plain formatter for JSON records and writing to both sinks at once.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Installs the global subscriber. The returned guard must be held for the
/// lifetime of the process: dropping it stops the background flush thread
/// and truncates any buffered log lines.
pub fn init(config: &Config) -> anyhow::Result<WorkerGuard> {
    if let Some(parent) = config.log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file_appender = tracing_appender::rolling::never(
        config.log_file.parent().unwrap_or_else(|| std::path::Path::new(".")),
        config
            .log_file
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("app.jsonl")),
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let writer = non_blocking.and(std::io::stdout);

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .with_current_span(false)
        .init();

    Ok(guard)
}

use std::fs::File;
use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Keeps the non-blocking file appender alive for the process lifetime.
pub struct FileLoggerGuard {
    _append_guard: WorkerGuard,
}

/// Configures tracing: a compact stdout layer driven by `RUST_LOG` (falling
/// back to `default`), plus an optional JSON file layer.
pub fn setup_logging(
    log_path: Option<&Path>,
    default: LevelFilter,
) -> anyhow::Result<Option<FileLoggerGuard>> {
    let stdout_subscriber = tracing_subscriber::fmt::layer()
        .compact()
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(default.into())
                .from_env_lossy(),
        );

    let Some(log_path) = log_path else {
        tracing_subscriber::registry()
            .with(stdout_subscriber)
            .init();
        return Ok(None);
    };

    let log_file = File::create(log_path)?;

    let (file_appender, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .finish(log_file);

    let file_subscriber = tracing_subscriber::fmt::layer()
        .json()
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::FULL)
        .with_writer(file_appender);

    tracing_subscriber::registry()
        .with(stdout_subscriber)
        .with(file_subscriber)
        .init();

    tracing::info!("Writing log to {:?}", log_path);

    Ok(Some(FileLoggerGuard {
        _append_guard: guard,
    }))
}

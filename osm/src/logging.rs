//! Structured logging setup (SPEC_FULL.md §6 "Log files"): one file per
//! invocation, mirrored to stdout, verbosity controlled by the `debug`
//! flag in the JSON input rather than `RUST_LOG` directly.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initializes the global tracing subscriber with a stdout layer and a
/// file layer writing to `log_file`. The returned [`WorkerGuard`] must
/// be held for the lifetime of the process; dropping it flushes and
/// stops the background writer thread.
pub fn init(log_file: &Path, debug: bool) -> std::io::Result<WorkerGuard> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let dir = log_file.parent().unwrap_or_else(|| Path::new("."));
    let file_name = log_file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("osm.log");
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_span_events(FmtSpan::CLOSE);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(guard)
}

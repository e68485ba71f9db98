//! Logging initialization.
//!
//! Console output honors `RUST_LOG`; a non-blocking daily-rotated file
//! appender mirrors everything at the same filter level.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "xg2g=info,sqlx=warn,tower_http=info";

/// Initialize the global tracing subscriber.
///
/// Returns the appender guard; dropping it flushes and stops the background
/// writer, so the caller must keep it alive for the process lifetime.
pub fn init_logging(log_dir: impl AsRef<Path>) -> std::io::Result<WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily(log_dir.as_ref(), "xg2g.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_filter(file_filter);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

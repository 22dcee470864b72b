//! Tracing subscriber setup.
//!
//! Embedders that already install a subscriber can skip this module; the
//! crate itself only emits `tracing` events.

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Builds the filter: `RUST_LOG` wins when set, otherwise `level`.
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs a stderr subscriber at `level`.
pub fn init(level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

/// Installs a subscriber writing to a daily-rotated file under `dir`.
///
/// The returned guard flushes pending records when dropped; keep it alive
/// for the lifetime of the process.
pub fn init_with_file(level: &str, dir: &Path, prefix: &str) -> Result<WorkerGuard> {
    let appender = tracing_appender::rolling::daily(dir, prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(guard)
}

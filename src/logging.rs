use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_NAME: &str = "obs-autoscene.log";

/// Keeps the file writer thread alive; logs are flushed when dropped.
pub struct LogGuard {
    _guard: WorkerGuard,
}

/// `RUST_LOG` wins over the configured level.
fn filter(level: &str) -> EnvFilter {
    let default = match level.trim().to_ascii_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy()
}

/// Initializes logging to stderr and to `<logs_dir>/obs-autoscene.log`.
pub fn init(level: &str, logs_dir: &Path) -> Result<LogGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("Failed to create log directory {}", logs_dir.display()))?;
    let log_path = logs_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter(level));
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_thread_names(true)
        .with_filter(filter(level));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Logging already initialized")?;

    tracing::info!("Logging to {}", log_path.display());
    Ok(LogGuard { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    use tracing::level_filters::LevelFilter;

    #[test]
    fn test_configured_level_is_default() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert_eq!(filter("debug").max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(filter(" WARN ").max_level_hint(), Some(LevelFilter::WARN));
        assert_eq!(filter("loud").max_level_hint(), Some(LevelFilter::INFO));
    }
}

//! Logging module for k3man
//!
//! Provides stdout logging for serverless invocations plus optional
//! file-based logging with millisecond timestamps for local runs.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingSettings;

/// Initialize logging based on configuration
///
/// # Arguments
/// * `config` - Logging configuration from settings
pub fn init_logging(config: &LoggingSettings) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer()
        .with_ansi(false)
        .with_timer(fmt::time::ChronoUtc::new(
            "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        ))
        .with_target(false)
        .with_level(true);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    if config.file_enabled {
        let log_path = PathBuf::from(&config.file);
        let log_dir = log_path
            .parent()
            .context("Invalid log file path")?
            .to_path_buf();
        let log_filename = log_path
            .file_name()
            .context("Invalid log filename")?
            .to_str()
            .context("Invalid UTF-8 in log filename")?;

        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(log_filename)
            .build(log_dir)
            .context("Failed to create log file appender")?;

        let file_layer = fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false)
            .with_timer(fmt::time::ChronoUtc::new(
                "%Y-%m-%d %H:%M:%S%.3f".to_string(),
            ))
            .with_target(false)
            .with_level(true)
            .with_thread_ids(false)
            .with_thread_names(false);

        registry
            .with(file_layer)
            .try_init()
            .context("Failed to initialize tracing subscriber")?;
    } else {
        registry
            .try_init()
            .context("Failed to initialize tracing subscriber")?;
    }

    let level = parse_log_level(&config.level)?;
    tracing::debug!(level = %level, "Logging initialized");

    Ok(())
}

/// Map the configured level onto a tracing level
///
/// An empty value falls back to info so a blank `K3MAN_LOG_LEVEL` does not
/// kill the handler.
fn parse_log_level(level: &str) -> Result<Level> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "" | "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => anyhow::bail!("unrecognized log level '{}'", other),
    }
}

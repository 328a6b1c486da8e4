//! Logging initialisation via tracing.

use std::io;

use anyhow::Result;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::domain::models::LoggingConfig;

/// Keeps the non-blocking file writer alive for the process lifetime.
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

/// Initialise the global subscriber from the loaded configuration.
///
/// Stdout respects the configured format; the optional log file is always
/// JSON for structured ingestion.
pub fn init(config: &LoggingConfig) -> Result<LogGuard> {
    let default_level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let guard = if let Some(ref path) = config.file {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);

        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_filter(env_filter);

        let stdout_filter = EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy();
        if config.format == "json" {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(io::stdout)
                .with_filter(stdout_filter);
            tracing_subscriber::registry().with(file_layer).with(stdout_layer).init();
        } else {
            let stdout_layer =
                tracing_subscriber::fmt::layer().with_writer(io::stdout).with_filter(stdout_filter);
            tracing_subscriber::registry().with(file_layer).with(stdout_layer).init();
        }
        Some(guard)
    } else {
        if config.format == "json" {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(io::stdout)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(stdout_layer).init();
        } else {
            let stdout_layer =
                tracing_subscriber::fmt::layer().with_writer(io::stdout).with_filter(env_filter);
            tracing_subscriber::registry().with(stdout_layer).init();
        }
        None
    };

    Ok(LogGuard { _guard: guard })
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => anyhow::bail!("invalid log level: {other}"),
    }
}

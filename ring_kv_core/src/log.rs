//! Structured logging for coordinators and storage nodes
//!
//! Built on `tracing`: console or daily-rotated file output, text or JSON,
//! plus span helpers for the cluster, migration and replication paths.

use crate::config::{LogFormat, LogLevel, LoggingConfig};
use crate::error::{KvError, Result};
use std::path::Path;
use std::sync::Once;
use std::time::Duration;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::{format::FmtSpan, time::UtcTime};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize the logging system based on configuration.
///
/// Only the first call installs a subscriber. When logging to a file the
/// returned guard must be kept alive for buffered lines to be flushed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let mut outcome = Ok(None);
    INIT.call_once(|| {
        outcome = init_logging_inner(config);
    });
    outcome
}

fn init_logging_inner(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let level = convert_log_level(&config.level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_ascii_lowercase()));

    let (writer, guard) = match &config.file_path {
        Some(file_path) => {
            let (writer, guard) = create_file_writer(file_path)?;
            (writer, Some(guard))
        }
        None if config.console => (BoxMakeWriter::new(std::io::stderr), None),
        None => (BoxMakeWriter::new(std::io::sink), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(UtcTime::rfc_3339())
        .with_ansi(config.file_path.is_none())
        .with_writer(writer);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed.map_err(|e| KvError::Config(format!("failed to install logger: {}", e)))?;

    tracing::info!("Logging system initialized with level: {:?}", config.level);
    Ok(guard)
}

/// Daily-rotated, non-blocking file writer.
fn create_file_writer(file_path: &str) -> Result<(BoxMakeWriter, WorkerGuard)> {
    let path = Path::new(file_path);
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| KvError::Config(format!("log path '{}' has no file name", file_path)))?;

    std::fs::create_dir_all(directory)?;
    let appender = tracing_appender::rolling::daily(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    Ok((BoxMakeWriter::new(writer), guard))
}

/// Convert our log level to tracing level
fn convert_log_level(level: &LogLevel) -> Level {
    match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

/// Log a membership operation (join, leave, heartbeat removal, election)
pub fn log_cluster_operation(operation: &str, node: &str, success: bool, duration: Duration) {
    let span = tracing::info_span!(
        "cluster_operation",
        operation = operation,
        node = node,
        success = success,
        duration_ms = duration.as_millis() as u64,
    );
    let _enter = span.enter();

    if success {
        tracing::info!("Cluster operation completed successfully");
    } else {
        tracing::error!("Cluster operation failed");
    }
}

/// Log one RPC of the two-phase migration
pub fn log_migration_step(step: &str, address: &str, success: bool, duration: Duration) {
    let span = tracing::info_span!(
        "migration_step",
        step = step,
        address = address,
        success = success,
        duration_ms = duration.as_millis() as u64,
    );
    let _enter = span.enter();

    if success {
        tracing::debug!("Migration step acknowledged");
    } else {
        tracing::error!("Migration step failed");
    }
}

/// Log a push to a replica successor
pub fn log_replication_push(action: &str, target: &str, success: bool, duration: Duration) {
    let span = tracing::info_span!(
        "replication_push",
        action = action,
        target = target,
        success = success,
        duration_ms = duration.as_millis() as u64,
    );
    let _enter = span.enter();

    if success {
        tracing::debug!("Replica accepted update");
    } else {
        tracing::warn!("Replica push failed, continuing");
    }
}

/// Log process startup
pub fn log_startup(role: &str, address: &str) {
    tracing::info!("Starting {} on {}", role, address);
}

/// Log process shutdown
pub fn log_shutdown(reason: &str) {
    tracing::info!("Shutting down: {}", reason);
}

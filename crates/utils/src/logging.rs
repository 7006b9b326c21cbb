//! provides logging helpers

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Tracing target for admission decisions and partition transitions.
///
/// Events with this target are written to the audit file when one is
/// configured, and kept out of the console output.
pub const AUDIT_TARGET: &str = "audit";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber for console only output
pub fn init() {
    let fmt_layer = layer()
        .with_writer(io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    registry().with(fmt_layer).init();
}

/// initiate the global tracing subscriber with a daily rolling audit file.
///
/// The returned guard must be held for as long as audit events should be
/// flushed to disk.
pub fn init_with_audit<P: AsRef<Path>>(audit_file: P) -> io::Result<WorkerGuard> {
    let audit_file = audit_file.as_ref();
    let dir = audit_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = audit_file
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "audit file name"))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(7)
        .build(dir)
        .map_err(io::Error::other)?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let fmt_layer = layer()
        .with_writer(io::stderr)
        .with_target(true)
        .with_filter(env_filter().and(filter::filter_fn(|metadata| {
            metadata.target() != AUDIT_TARGET
        })));

    let audit_layer = layer()
        .json()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target() == AUDIT_TARGET
        }));

    registry().with(fmt_layer).with(audit_layer).init();
    Ok(guard)
}

//! Leveled file log for the launcher. Every record is also emitted as a
//! `tracing` event, so console output follows `RUST_LOG`.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
};

use anyhow::Context;
use chrono::Utc;

pub const LOG_FILE_NAME: &str = "launcher.log";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

struct FileSink {
    file: Mutex<File>,
    min_level: Level,
}

static SINK: OnceLock<FileSink> = OnceLock::new();

/// Appends to `<log_dir>/launcher.log`. Returns the file path. Records
/// logged before this call only reach `tracing`.
pub fn init(log_dir: &Path, min_level: Level) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;
    let path = log_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    SINK.set(FileSink {
        file: Mutex::new(file),
        min_level,
    })
    .map_err(|_| anyhow::anyhow!("launcher log already initialized"))?;
    Ok(path)
}

pub fn log(level: Level, target: &str, message: &str) {
    emit_tracing(level, target, message);
    let Some(sink) = SINK.get() else {
        return;
    };
    if level < sink.min_level {
        return;
    }
    if let Ok(mut file) = sink.file.lock() {
        let _ = writeln!(
            file,
            "{} [{level:?}] {target} - {message}",
            Utc::now().to_rfc3339()
        );
    }
}

// tracing macros need a static level, so each arm names its own.
fn emit_tracing(level: Level, target: &str, message: &str) {
    match level {
        Level::Trace => tracing::trace!(source = target, "{message}"),
        Level::Debug => tracing::debug!(source = target, "{message}"),
        Level::Info => tracing::info!(source = target, "{message}"),
        Level::Warn => tracing::warn!(source = target, "{message}"),
        Level::Error => tracing::error!(source = target, "{message}"),
    }
}

pub fn trace(target: &str, message: impl AsRef<str>) {
    log(Level::Trace, target, message.as_ref());
}

pub fn debug(target: &str, message: impl AsRef<str>) {
    log(Level::Debug, target, message.as_ref());
}

pub fn info(target: &str, message: impl AsRef<str>) {
    log(Level::Info, target, message.as_ref());
}

pub fn warn(target: &str, message: impl AsRef<str>) {
    log(Level::Warn, target, message.as_ref());
}

pub fn error(target: &str, message: impl AsRef<str>) {
    log(Level::Error, target, message.as_ref());
}

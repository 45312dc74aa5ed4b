//! Observability Stack for tabula
//!
//! Provides the request audit trail and service monitoring:
//! - Append-only per-day JSON-lines audit log with sensitive-field redaction
//! - Rolling-window request metrics and a 0-100 health score
//! - Threshold and error alerts dispatched to registered handlers

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod alert;
pub mod logger;
pub mod monitor;
pub mod redact;

pub use alert::{Alert, AlertHandler, AlertLevel, TracingAlertHandler};
pub use logger::{EventType, LogLevel, RequestLogEntry, RequestLogger};
pub use monitor::{HealthReport, HealthStatus, MetricsSnapshot, Monitor};
pub use redact::{Redactor, REDACTED};

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Remove files in `dir` whose modification time is older than `max_age`
///
/// Returns the number of removed files; a missing directory removes nothing.
pub(crate) fn remove_files_older_than(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        if metadata.modified()? < cutoff {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }

    Ok(removed)
}

/// Append one JSON line to `path`, creating parent directories as needed
///
/// The line is written with a single `write_all` on an append-mode handle so
/// that concurrent writers holding the same lock never interleave.
pub(crate) fn append_json_line(path: &Path, value: &serde_json::Value) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');

    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)
}

//! Append-only request audit log
//!
//! One JSON object per line in `{dir}/api_{YYYY-MM-DD}.log`:
//! `{"timestamp", "type", "level", "data"}`. Bodies, headers, query
//! parameters and contexts pass through the [`Redactor`] before they are
//! serialized. The active file is renamed once it grows past
//! `max_file_size`.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use tabula_common::config::LoggingConfig;

use crate::monitor::Monitor;
use crate::redact::Redactor;
use crate::{append_json_line, remove_files_older_than};

/// Kind of audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Request,
    Auth,
    Error,
    Security,
    #[serde(rename = "ratelimit")]
    RateLimit,
}

/// Severity recorded with each event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Everything recorded about one handled request
#[derive(Debug, Clone, Default)]
pub struct RequestLogEntry {
    pub request_id: String,
    pub method: String,
    pub action: Option<String>,
    pub table: Option<String>,
    pub status: u16,
    pub duration_ms: f64,
    pub response_size: usize,
    pub client_ip: Option<String>,
    pub user: Option<String>,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub error: Option<String>,
}

pub struct RequestLogger {
    config: LoggingConfig,
    redactor: Redactor,
    write_lock: Mutex<()>,
    monitor: Option<Arc<Monitor>>,
}

impl RequestLogger {
    #[must_use]
    pub fn new(config: LoggingConfig) -> Self {
        let redactor = Redactor::new(&config.sensitive_keys);
        Self {
            config,
            redactor,
            write_lock: Mutex::new(()),
            monitor: None,
        }
    }

    /// Forward request, auth, rate-limit and error events to `monitor`
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    #[must_use]
    pub fn monitor(&self) -> Option<&Arc<Monitor>> {
        self.monitor.as_ref()
    }

    #[must_use]
    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Path of today's active log file
    #[must_use]
    pub fn current_log_path(&self) -> PathBuf {
        self.config
            .dir
            .join(format!("api_{}.log", Utc::now().format("%Y-%m-%d")))
    }

    pub fn log_request(&self, entry: &RequestLogEntry) {
        if let Some(monitor) = &self.monitor {
            monitor.record_request(entry.status, entry.duration_ms);
        }

        let level = match entry.status {
            500.. => LogLevel::Error,
            400..=499 => LogLevel::Warning,
            _ => LogLevel::Info,
        };

        let mut data = json!({
            "request_id": entry.request_id,
            "method": entry.method,
            "action": entry.action,
            "table": entry.table,
            "status": entry.status,
            "duration_ms": entry.duration_ms,
            "response_size": entry.response_size,
            "client_ip": entry.client_ip,
            "user": entry.user,
            "query": self.redactor.redact_map(&entry.query),
        });
        if self.config.log_headers {
            data["headers"] = self.redactor.redact_map(&entry.headers);
        }
        if self.config.log_bodies {
            if let Some(body) = &entry.body {
                data["body"] = self.redactor.redact(body);
            }
        }
        if let Some(error) = &entry.error {
            data["error"] = Value::String(error.clone());
        }

        self.write(EventType::Request, level, data);
    }

    /// Record an authentication attempt; failures are logged as warnings
    pub fn log_auth(&self, method: &str, success: bool, identifier: Option<&str>, reason: Option<&str>) {
        if !success {
            if let Some(monitor) = &self.monitor {
                monitor.record_auth_failure();
            }
        }

        let level = if success { LogLevel::Info } else { LogLevel::Warning };
        self.write(
            EventType::Auth,
            level,
            json!({
                "method": method,
                "success": success,
                "identifier": identifier,
                "reason": reason,
            }),
        );
    }

    /// Record an unhandled error and raise a critical alert
    pub fn log_error(&self, message: &str, context: &Value) {
        let context = self.redactor.redact(context);
        if let Some(monitor) = &self.monitor {
            monitor.record_error(message, context.clone());
        }

        self.write(
            EventType::Error,
            LogLevel::Error,
            json!({
                "message": message,
                "context": context,
            }),
        );
    }

    pub fn log_security(&self, event: &str, details: &Value) {
        self.write(
            EventType::Security,
            LogLevel::Warning,
            json!({
                "event": event,
                "details": self.redactor.redact(details),
            }),
        );
    }

    pub fn log_rate_limit(&self, identifier: &str, limit: u32, window_seconds: u64) {
        if let Some(monitor) = &self.monitor {
            monitor.record_rate_limit_hit();
        }

        self.write(
            EventType::RateLimit,
            LogLevel::Warning,
            json!({
                "identifier": identifier,
                "limit": limit,
                "window": window_seconds,
            }),
        );
    }

    /// Delete log files older than the retention window
    ///
    /// # Errors
    /// Returns an error if the log directory cannot be read.
    pub fn cleanup(&self) -> std::io::Result<usize> {
        let max_age = std::time::Duration::from_secs(self.config.retention_days * 86_400);
        remove_files_older_than(&self.config.dir, max_age)
    }

    fn write(&self, event: EventType, level: LogLevel, data: Value) {
        if !self.config.enabled {
            return;
        }

        let now = Utc::now();
        let line = json!({
            "timestamp": now.to_rfc3339(),
            "type": event,
            "level": level,
            "data": data,
        });

        let path = self.current_log_path();
        let _guard = self.write_lock.lock();
        self.rotate_if_needed(&path);
        if let Err(e) = append_json_line(&path, &line) {
            warn!(path = %path.display(), "failed to write audit log: {}", e);
        }
    }

    fn rotate_if_needed(&self, path: &Path) {
        let Ok(metadata) = fs::metadata(path) else {
            return;
        };
        if metadata.len() < self.config.max_file_size {
            return;
        }

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("api");
        let rotated = path.with_file_name(format!(
            "{stem}.{}.log",
            Utc::now().format("%H%M%S%.3f")
        ));
        if let Err(e) = fs::rename(path, &rotated) {
            warn!(path = %path.display(), "failed to rotate audit log: {}", e);
        }
    }
}

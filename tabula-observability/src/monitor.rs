//! Rolling-window request metrics, health scoring and alert dispatch

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use tabula_common::config::MonitorConfig;

use crate::alert::{Alert, AlertHandler, AlertLevel};
use crate::{append_json_line, remove_files_older_than};

/// Alerts kept in memory for the health report
const ALERT_HISTORY: usize = 100;
/// Alerts included in a health report
const RECENT_ALERTS: usize = 10;
/// Samples required before rate-based threshold alerts fire
const MIN_SAMPLES_FOR_ALERT: usize = 10;
/// Window in which a critical alert lowers the health score
const CRITICAL_ALERT_WINDOW_SECS: i64 = 300;
/// Minimum spacing between identical threshold alerts
const ALERT_DEDUP_SECS: i64 = 60;

/// Overall service status derived from the health score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    #[must_use]
    pub fn from_score(score: u8) -> Self {
        if score >= 80 {
            Self::Healthy
        } else if score >= 50 {
            Self::Degraded
        } else {
            Self::Critical
        }
    }
}

/// Aggregated metrics over the rolling window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub window_seconds: u64,
    pub request_count: usize,
    pub error_count: usize,
    /// Percentage of requests answered with a 5xx status
    pub error_rate: f64,
    pub avg_response_ms: f64,
    pub min_response_ms: f64,
    pub max_response_ms: f64,
    pub status_codes: BTreeMap<u16, usize>,
    pub auth_failures: usize,
    pub rate_limit_hits: usize,
}

/// Health report served on `/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub score: u8,
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub metrics: MetricsSnapshot,
    pub recent_alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: DateTime<Utc>,
    status: u16,
    duration_ms: f64,
}

#[derive(Default)]
struct MonitorState {
    samples: VecDeque<Sample>,
    auth_failures: VecDeque<DateTime<Utc>>,
    rate_limit_hits: VecDeque<DateTime<Utc>>,
    alerts: VecDeque<Alert>,
    last_raised: HashMap<String, DateTime<Utc>>,
}

impl MonitorState {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.samples.front().is_some_and(|s| s.at < cutoff) {
            self.samples.pop_front();
        }
        while self.auth_failures.front().is_some_and(|t| *t < cutoff) {
            self.auth_failures.pop_front();
        }
        while self.rate_limit_hits.front().is_some_and(|t| *t < cutoff) {
            self.rate_limit_hits.pop_front();
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn snapshot(&self, window_seconds: u64) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot {
            window_seconds,
            request_count: self.samples.len(),
            auth_failures: self.auth_failures.len(),
            rate_limit_hits: self.rate_limit_hits.len(),
            ..MetricsSnapshot::default()
        };
        if self.samples.is_empty() {
            return snapshot;
        }

        let mut total = 0.0;
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        for sample in &self.samples {
            total += sample.duration_ms;
            min = min.min(sample.duration_ms);
            max = max.max(sample.duration_ms);
            *snapshot.status_codes.entry(sample.status).or_insert(0) += 1;
            if sample.status >= 500 {
                snapshot.error_count += 1;
            }
        }

        let count = self.samples.len() as f64;
        snapshot.error_rate = snapshot.error_count as f64 / count * 100.0;
        snapshot.avg_response_ms = total / count;
        snapshot.min_response_ms = min;
        snapshot.max_response_ms = max;
        snapshot
    }
}

/// Service monitor
///
/// Samples are kept in memory for `window_seconds`; every request sample and
/// alert is also appended to `metrics_{date}.jsonl` / `alerts_{date}.jsonl`.
pub struct Monitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
    write_lock: Mutex<()>,
    started: Instant,
}

impl Monitor {
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
            handlers: RwLock::new(Vec::new()),
            write_lock: Mutex::new(()),
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Register a handler that receives every alert
    pub fn register_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.handlers.write().push(handler);
    }

    /// Record a completed request
    pub fn record_request(&self, status: u16, duration_ms: f64) {
        self.record_request_at(status, duration_ms, Utc::now());
    }

    fn record_request_at(&self, status: u16, duration_ms: f64, now: DateTime<Utc>) {
        if !self.config.enabled {
            return;
        }

        let snapshot = {
            let mut state = self.state.lock();
            state.samples.push_back(Sample {
                at: now,
                status,
                duration_ms,
            });
            state.prune(self.cutoff(now));
            state.snapshot(self.config.window_seconds)
        };

        self.persist(
            "metrics",
            &json!({
                "timestamp": now.to_rfc3339(),
                "status": status,
                "duration_ms": duration_ms,
            }),
        );

        if snapshot.request_count >= MIN_SAMPLES_FOR_ALERT {
            if snapshot.error_rate > self.config.error_rate_threshold {
                self.raise_threshold_alert(
                    "High error rate",
                    json!({
                        "error_rate": snapshot.error_rate,
                        "threshold": self.config.error_rate_threshold,
                    }),
                    now,
                );
            }
            if snapshot.avg_response_ms > self.config.response_time_threshold_ms {
                self.raise_threshold_alert(
                    "Slow response time",
                    json!({
                        "avg_response_ms": snapshot.avg_response_ms,
                        "threshold": self.config.response_time_threshold_ms,
                    }),
                    now,
                );
            }
        }
    }

    /// Record a failed authentication attempt
    pub fn record_auth_failure(&self) {
        self.record_auth_failure_at(Utc::now());
    }

    fn record_auth_failure_at(&self, now: DateTime<Utc>) {
        if !self.config.enabled {
            return;
        }
        let count = {
            let mut state = self.state.lock();
            state.auth_failures.push_back(now);
            state.prune(self.cutoff(now));
            state.auth_failures.len()
        };
        if count as u64 > self.config.auth_failure_threshold {
            self.raise_threshold_alert(
                "Excessive authentication failures",
                json!({"count": count, "threshold": self.config.auth_failure_threshold}),
                now,
            );
        }
    }

    /// Record a request rejected by the rate limiter
    pub fn record_rate_limit_hit(&self) {
        self.record_rate_limit_hit_at(Utc::now());
    }

    fn record_rate_limit_hit_at(&self, now: DateTime<Utc>) {
        if !self.config.enabled {
            return;
        }
        let count = {
            let mut state = self.state.lock();
            state.rate_limit_hits.push_back(now);
            state.prune(self.cutoff(now));
            state.rate_limit_hits.len()
        };
        if count as u64 > self.config.rate_limit_threshold {
            self.raise_threshold_alert(
                "Excessive rate limit hits",
                json!({"count": count, "threshold": self.config.rate_limit_threshold}),
                now,
            );
        }
    }

    /// Record an unhandled error; always raises a critical alert
    pub fn record_error(&self, message: &str, context: Value) {
        self.trigger_alert(AlertLevel::Critical, message, context);
    }

    /// Persist an alert and pass it to every registered handler
    pub fn trigger_alert(&self, level: AlertLevel, message: &str, context: Value) -> Option<Alert> {
        if !self.config.enabled {
            return None;
        }

        let alert = Alert::new(level, message, context);
        {
            let mut state = self.state.lock();
            state.alerts.push_back(alert.clone());
            while state.alerts.len() > ALERT_HISTORY {
                state.alerts.pop_front();
            }
        }

        match serde_json::to_value(&alert) {
            Ok(value) => self.persist("alerts", &value),
            Err(e) => warn!("failed to serialize alert: {}", e),
        }

        let handlers = self.handlers.read().clone();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(&alert))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(alert_id = %alert.id, "alert handler failed: {}", e),
                Err(_) => warn!(alert_id = %alert.id, "alert handler panicked"),
            }
        }

        Some(alert)
    }

    fn raise_threshold_alert(&self, message: &str, context: Value, now: DateTime<Utc>) {
        {
            let mut state = self.state.lock();
            if let Some(last) = state.last_raised.get(message) {
                if now - *last < Duration::seconds(ALERT_DEDUP_SECS) {
                    debug!(message, "threshold alert suppressed");
                    return;
                }
            }
            state.last_raised.insert(message.to_string(), now);
        }
        self.trigger_alert(AlertLevel::Warning, message, context);
    }

    /// Metrics over the current window
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics_at(Utc::now())
    }

    fn metrics_at(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let mut state = self.state.lock();
        state.prune(self.cutoff(now));
        state.snapshot(self.config.window_seconds)
    }

    /// Health score and status
    #[must_use]
    pub fn health(&self) -> HealthReport {
        self.health_at(Utc::now())
    }

    fn health_at(&self, now: DateTime<Utc>) -> HealthReport {
        let metrics = self.metrics_at(now);
        let (recent_critical, recent_alerts) = {
            let state = self.state.lock();
            let critical_cutoff = now - Duration::seconds(CRITICAL_ALERT_WINDOW_SECS);
            let recent_critical = state
                .alerts
                .iter()
                .any(|a| a.level == AlertLevel::Critical && a.timestamp >= critical_cutoff);
            let recent: Vec<Alert> = state.alerts.iter().rev().take(RECENT_ALERTS).cloned().collect();
            (recent_critical, recent)
        };

        let mut score: u8 = 100;
        if metrics.error_rate > self.config.error_rate_threshold {
            score = score.saturating_sub(30);
        }
        if metrics.avg_response_ms > self.config.response_time_threshold_ms {
            score = score.saturating_sub(20);
        }
        if recent_critical {
            score = score.saturating_sub(25);
        }

        HealthReport {
            score,
            status: HealthStatus::from_score(score),
            uptime_seconds: self.started.elapsed().as_secs(),
            metrics,
            recent_alerts,
        }
    }

    /// Remove metric and alert files older than the retention window
    ///
    /// # Errors
    /// Returns an error if the metrics directory cannot be read.
    pub fn cleanup(&self) -> std::io::Result<usize> {
        let max_age = std::time::Duration::from_secs(self.config.retention_days * 86_400);
        remove_files_older_than(&self.config.dir, max_age)
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(i64::try_from(self.config.window_seconds).unwrap_or(i64::MAX))
    }

    fn persist(&self, kind: &str, value: &Value) {
        let path = self
            .config
            .dir
            .join(format!("{kind}_{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let _guard = self.write_lock.lock();
        if let Err(e) = append_json_line(&path, value) {
            warn!(path = %path.display(), "failed to write {} record: {}", kind, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tabula_common::error::Error;

    fn monitor(dir: &std::path::Path) -> Monitor {
        Monitor::new(MonitorConfig {
            dir: dir.to_path_buf(),
            ..MonitorConfig::default()
        })
    }

    #[test]
    fn test_metrics_aggregation() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());
        monitor.record_request(200, 10.0);
        monitor.record_request(404, 30.0);
        monitor.record_request(500, 50.0);
        monitor.record_rate_limit_hit();
        monitor.record_auth_failure();

        let m = monitor.metrics();
        assert_eq!(m.request_count, 3);
        assert_eq!(m.error_count, 1);
        assert!((m.error_rate - 100.0 / 3.0).abs() < 1e-9);
        assert!((m.avg_response_ms - 30.0).abs() < 1e-9);
        assert!((m.min_response_ms - 10.0).abs() < 1e-9);
        assert!((m.max_response_ms - 50.0).abs() < 1e-9);
        assert_eq!(m.status_codes.get(&404), Some(&1));
        assert_eq!(m.auth_failures, 1);
        assert_eq!(m.rate_limit_hits, 1);
    }

    #[test]
    fn test_samples_leave_window() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());
        let now = Utc::now();
        monitor.record_request_at(200, 5.0, now - Duration::seconds(600));
        monitor.record_request_at(200, 5.0, now);
        assert_eq!(monitor.metrics_at(now).request_count, 1);
    }

    #[test]
    fn test_health_score_bands() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());
        let report = monitor.health();
        assert_eq!(report.score, 100);
        assert_eq!(report.status, HealthStatus::Healthy);

        // error rate above 5% and slow responses
        monitor.record_request(500, 2000.0);
        let report = monitor.health();
        assert_eq!(report.score, 50);
        assert_eq!(report.status, HealthStatus::Degraded);

        monitor.record_error("database unavailable", json!({}));
        let report = monitor.health();
        assert_eq!(report.score, 25);
        assert_eq!(report.status, HealthStatus::Critical);
        assert_eq!(report.recent_alerts[0].message, "database unavailable");
    }

    #[test]
    fn test_old_critical_alert_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());
        monitor.record_error("boom", Value::Null);
        let later = Utc::now() + Duration::seconds(CRITICAL_ALERT_WINDOW_SECS + 1);
        assert_eq!(monitor.health_at(later).score, 100);
    }

    #[test]
    fn test_handler_failures_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());
        let delivered = Arc::new(AtomicUsize::new(0));

        monitor.register_handler(Arc::new(|_: &Alert| -> tabula_common::Result<()> {
            Err(Error::Internal("webhook down".into()))
        }));
        monitor.register_handler(Arc::new(|_: &Alert| -> tabula_common::Result<()> {
            panic!("handler bug")
        }));
        let counter = Arc::clone(&delivered);
        monitor.register_handler(Arc::new(move |_: &Alert| -> tabula_common::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert!(monitor
            .trigger_alert(AlertLevel::Info, "deploy", Value::Null)
            .is_some());
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_threshold_alert_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = Monitor::new(MonitorConfig {
            dir: dir.path().to_path_buf(),
            auth_failure_threshold: 2,
            ..MonitorConfig::default()
        });
        let now = Utc::now();
        for _ in 0..6 {
            monitor.record_auth_failure_at(now);
        }
        let alerts = monitor.health_at(now).recent_alerts;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Warning);

        monitor.record_auth_failure_at(now + Duration::seconds(ALERT_DEDUP_SECS + 1));
        assert_eq!(monitor.health_at(now).recent_alerts.len(), 2);
    }

    #[test]
    fn test_records_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());
        monitor.record_request(201, 3.0);
        monitor.record_error("boom", json!({"table": "users"}));

        let date = Utc::now().format("%Y-%m-%d");
        let metrics = std::fs::read_to_string(dir.path().join(format!("metrics_{date}.jsonl"))).unwrap();
        assert_eq!(metrics.lines().count(), 1);
        let alerts = std::fs::read_to_string(dir.path().join(format!("alerts_{date}.jsonl"))).unwrap();
        let alert: Value = serde_json::from_str(alerts.trim()).unwrap();
        assert_eq!(alert["level"], "critical");
        assert_eq!(alert["context"]["table"], "users");
    }

    #[test]
    fn test_disabled_monitor_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = Monitor::new(MonitorConfig {
            enabled: false,
            dir: dir.path().join("metrics"),
            ..MonitorConfig::default()
        });
        monitor.record_request(500, 1.0);
        assert!(monitor.trigger_alert(AlertLevel::Critical, "x", Value::Null).is_none());
        assert_eq!(monitor.metrics().request_count, 0);
        assert!(!dir.path().join("metrics").exists());
    }
}

//! Alerts raised by the monitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use tabula_common::error::Result;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// A raised alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub level: AlertLevel,
    pub message: String,
    pub context: Value,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    #[must_use]
    pub fn new(level: AlertLevel, message: impl Into<String>, context: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            message: message.into(),
            context,
            timestamp: Utc::now(),
        }
    }
}

/// Receives every alert the monitor raises
///
/// Failures returned from a handler are logged and otherwise ignored.
pub trait AlertHandler: Send + Sync {
    /// # Errors
    /// Implementations may fail; the monitor swallows the error.
    fn handle(&self, alert: &Alert) -> Result<()>;
}

impl<F> AlertHandler for F
where
    F: Fn(&Alert) -> Result<()> + Send + Sync,
{
    fn handle(&self, alert: &Alert) -> Result<()> {
        self(alert)
    }
}

/// Forwards alerts to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertHandler;

impl AlertHandler for TracingAlertHandler {
    fn handle(&self, alert: &Alert) -> Result<()> {
        match alert.level {
            AlertLevel::Critical => {
                tracing::error!(alert_id = %alert.id, context = %alert.context, "{}", alert.message);
            }
            AlertLevel::Warning => {
                tracing::warn!(alert_id = %alert.id, context = %alert.context, "{}", alert.message);
            }
            AlertLevel::Info => {
                tracing::info!(alert_id = %alert.id, context = %alert.context, "{}", alert.message);
            }
        }
        Ok(())
    }
}

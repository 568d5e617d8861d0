//! Alert dispatch.
//!
//! Typed alert kinds fan out to pluggable handlers. The log handler is always
//! installed; the email handler is optional and renders the outbound message
//! from SMTP settings, leaving wire delivery to the operator's transport.
//! Raised alerts are kept in a bounded in-memory history for the API.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

const MAX_ALERT_HISTORY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighErrorRate,
    DataStale,
    SchedulerFailed,
    UpstreamTimeout,
    ConsecutiveFailures,
    Custom,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HighErrorRate => "high_error_rate",
            AlertKind::DataStale => "data_stale",
            AlertKind::SchedulerFailed => "scheduler_failed",
            AlertKind::UpstreamTimeout => "upstream_timeout",
            AlertKind::ConsecutiveFailures => "consecutive_failures",
            AlertKind::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub context: Option<serde_json::Value>,
    pub raised_at: DateTime<Utc>,
}

/// One delivery channel. Handlers must not block for long; delivery happens
/// inline on the raising task.
pub trait AlertHandler: Send + Sync {
    fn deliver(&self, alert: &Alert);
    fn name(&self) -> &'static str;
}

/// Always-on handler writing alerts to the structured log.
pub struct LogAlertHandler;

impl AlertHandler for LogAlertHandler {
    fn deliver(&self, alert: &Alert) {
        match alert.severity {
            AlertSeverity::Info => info!(
                kind = alert.kind.as_str(),
                message = %alert.message,
                "alert raised"
            ),
            AlertSeverity::Warning => warn!(
                kind = alert.kind.as_str(),
                message = %alert.message,
                "alert raised"
            ),
            AlertSeverity::Critical => error!(
                kind = alert.kind.as_str(),
                message = %alert.message,
                "alert raised"
            ),
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Formats an email for the configured recipient. Actual SMTP delivery sits
/// outside this process; the rendered message is handed to the log so the
/// operator-side relay can pick it up.
pub struct EmailAlertHandler {
    pub to: String,
    pub from: String,
    pub smtp_host: String,
    pub smtp_port: u16,
}

impl AlertHandler for EmailAlertHandler {
    fn deliver(&self, alert: &Alert) {
        let subject = format!(
            "[mdwarehouse] {:?} alert: {}",
            alert.severity,
            alert.kind.as_str()
        );
        info!(
            to = %self.to,
            from = %self.from,
            smtp = %format!("{}:{}", self.smtp_host, self.smtp_port),
            %subject,
            body = %alert.message,
            "alert email rendered"
        );
    }

    fn name(&self) -> &'static str {
        "email"
    }
}

pub struct AlertManager {
    handlers: Vec<Box<dyn AlertHandler>>,
    history: Mutex<VecDeque<Alert>>,
}

impl AlertManager {
    /// A manager with the log handler installed.
    pub fn new() -> Self {
        Self {
            handlers: vec![Box::new(LogAlertHandler)],
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_handler(mut self, handler: Box<dyn AlertHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn raise(
        &self,
        kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
        context: Option<serde_json::Value>,
    ) {
        let alert = Alert {
            kind,
            severity,
            message: message.into(),
            context,
            raised_at: Utc::now(),
        };

        for handler in &self.handlers {
            handler.deliver(&alert);
        }

        let mut history = self.history.lock();
        history.push_back(alert);
        if history.len() > MAX_ALERT_HISTORY {
            history.pop_front();
        }
    }

    /// Most recent alerts, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        let history = self.history.lock();
        history.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}

//! Observability core: trace ids, in-memory metrics, alert dispatch.

pub mod alerts;
pub mod metrics;

pub use alerts::{Alert, AlertHandler, AlertKind, AlertManager, AlertSeverity};
pub use metrics::{EndpointStats, HealthStatus, MetricsCollector};

use uuid::Uuid;

/// A fresh trace id for one request or one scheduler run.
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

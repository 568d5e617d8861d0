//! In-memory endpoint metrics.
//!
//! Per endpoint: request count, error count, and response-time percentiles
//! over a rolling 24-hour window. Samples live in a mutex-protected map of
//! bounded deques; recording and reading are O(1) and O(n log n) at the
//! sample sizes involved.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

const RETENTION_HOURS: i64 = 24;
/// Per-endpoint sample cap keeps a hot endpoint from growing without bound.
const MAX_SAMPLES_PER_ENDPOINT: usize = 10_000;

const DEGRADED_ERROR_RATE: f64 = 0.05;
const CRITICAL_ERROR_RATE: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Idle,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub count: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

struct Sample {
    at: DateTime<Utc>,
    latency_ms: f64,
    error: bool,
}

#[derive(Default)]
struct EndpointSeries {
    samples: std::collections::VecDeque<Sample>,
}

impl EndpointSeries {
    fn record(&mut self, latency_ms: f64, error: bool) {
        self.samples.push_back(Sample {
            at: Utc::now(),
            latency_ms,
            error,
        });
        if self.samples.len() > MAX_SAMPLES_PER_ENDPOINT {
            self.samples.pop_front();
        }
    }

    fn evict_expired(&mut self, cutoff: DateTime<Utc>) {
        while self
            .samples
            .front()
            .is_some_and(|sample| sample.at < cutoff)
        {
            self.samples.pop_front();
        }
    }
}

/// Collector shared by the HTTP layer and the scheduler.
#[derive(Default)]
pub struct MetricsCollector {
    series: Mutex<HashMap<String, EndpointSeries>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, endpoint: &str, latency_ms: f64, error: bool) {
        let mut series = self.series.lock();
        series
            .entry(endpoint.to_string())
            .or_default()
            .record(latency_ms, error);
    }

    /// Stats per endpoint over the retention window.
    pub fn snapshot(&self) -> Vec<EndpointStats> {
        let cutoff = Utc::now() - Duration::hours(RETENTION_HOURS);
        let mut series = self.series.lock();
        let mut out: Vec<EndpointStats> = series
            .iter_mut()
            .map(|(endpoint, s)| {
                s.evict_expired(cutoff);
                let count = s.samples.len() as u64;
                let errors = s.samples.iter().filter(|x| x.error).count() as u64;
                let mut latencies: Vec<f64> = s.samples.iter().map(|x| x.latency_ms).collect();
                latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                EndpointStats {
                    endpoint: endpoint.clone(),
                    count,
                    errors,
                    error_rate: if count > 0 {
                        errors as f64 / count as f64
                    } else {
                        0.0
                    },
                    p50_ms: percentile_of_sorted(&latencies, 0.50),
                    p95_ms: percentile_of_sorted(&latencies, 0.95),
                    p99_ms: percentile_of_sorted(&latencies, 0.99),
                }
            })
            .collect();
        out.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        out
    }

    /// Overall service health from the aggregate error rate.
    pub fn health_status(&self) -> HealthStatus {
        let stats = self.snapshot();
        let total: u64 = stats.iter().map(|s| s.count).sum();
        if total == 0 {
            return HealthStatus::Idle;
        }
        let errors: u64 = stats.iter().map(|s| s.errors).sum();
        let rate = errors as f64 / total as f64;
        if rate > CRITICAL_ERROR_RATE {
            HealthStatus::Critical
        } else if rate >= DEGRADED_ERROR_RATE {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

fn percentile_of_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64 * q).ceil() as usize).saturating_sub(1);
    sorted[index.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_collector_reports_idle() {
        let collector = MetricsCollector::new();
        assert_eq!(collector.health_status(), HealthStatus::Idle);
        assert!(collector.snapshot().is_empty());
    }

    #[test]
    fn percentiles_come_from_sorted_latencies() {
        let collector = MetricsCollector::new();
        for i in 1..=100 {
            collector.record("/api/v1/status", i as f64, false);
        }
        let stats = collector.snapshot();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 100);
        assert_eq!(stats[0].p50_ms, 50.0);
        assert_eq!(stats[0].p95_ms, 95.0);
        assert_eq!(stats[0].p99_ms, 99.0);
    }

    #[test]
    fn health_thresholds() {
        let healthy = MetricsCollector::new();
        for _ in 0..100 {
            healthy.record("/x", 1.0, false);
        }
        healthy.record("/x", 1.0, true);
        assert_eq!(healthy.health_status(), HealthStatus::Healthy);

        let degraded = MetricsCollector::new();
        for i in 0..100 {
            degraded.record("/x", 1.0, i < 7);
        }
        assert_eq!(degraded.health_status(), HealthStatus::Degraded);

        let critical = MetricsCollector::new();
        for i in 0..100 {
            critical.record("/x", 1.0, i < 20);
        }
        assert_eq!(critical.health_status(), HealthStatus::Critical);
    }

    #[test]
    fn error_rate_is_per_endpoint() {
        let collector = MetricsCollector::new();
        collector.record("/a", 5.0, false);
        collector.record("/b", 5.0, true);
        let stats = collector.snapshot();
        let a = stats.iter().find(|s| s.endpoint == "/a").unwrap();
        let b = stats.iter().find(|s| s.endpoint == "/b").unwrap();
        assert_eq!(a.error_rate, 0.0);
        assert_eq!(b.error_rate, 1.0);
    }
}

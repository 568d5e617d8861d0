//! Health and anomaly monitor.
//!
//! Four sweeps on a six-hour cadence: staleness per tracked pair, duplicate
//! keys (a guard; the primary key makes them structurally impossible),
//! intrabar outliers over the last day, and consecutive-failure alerting.

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use super::JobContext;
use crate::models::{AnomalySeverity, AnomalyType, Timeframe};
use crate::observability::{AlertKind, AlertSeverity};

/// |close - open| / open beyond which a candle is flagged as an outlier.
const OUTLIER_MOVE_THRESHOLD: f64 = 0.20;
const OUTLIER_SCAN_HOURS: i64 = 24;
/// Re-logging the same anomaly is suppressed inside this window.
const ANOMALY_DEDUP_HOURS: i64 = 6;

pub async fn run_health_sweep(ctx: &JobContext) {
    let started = Utc::now();
    info!("health sweep starting");

    let mut findings = 0usize;
    findings += staleness_sweep(ctx);
    findings += duplicate_sweep(ctx);
    findings += outlier_sweep(ctx);
    failure_alert_sweep(ctx);

    let elapsed_ms = (Utc::now() - started).num_milliseconds() as f64;
    ctx.metrics.record("job:health_monitor", elapsed_ms, false);
    info!(findings, "health sweep finished");
}

/// Severity scales with how wide the missed recovery window is.
fn staleness_severity(timeframe: Timeframe) -> AnomalySeverity {
    match timeframe.staleness_threshold().num_hours() {
        0..=1 => AnomalySeverity::Medium,
        2..=6 => AnomalySeverity::High,
        _ => AnomalySeverity::Critical,
    }
}

fn staleness_sweep(ctx: &JobContext) -> usize {
    let symbols = match ctx.db.list_active_symbols() {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "staleness sweep could not load symbols");
            return 0;
        }
    };

    let now = Utc::now();
    let mut found = 0usize;
    for record in &symbols {
        for timeframe in &record.timeframes {
            let latest = match ctx.db.latest_candle(&record.symbol, *timeframe) {
                Ok(Some(candle)) => candle,
                Ok(None) => continue,
                Err(e) => {
                    warn!(symbol = %record.symbol, error = %e, "staleness lookup failed");
                    continue;
                }
            };

            let threshold = timeframe.staleness_threshold();
            let age = now - latest.candle.time;
            if age <= threshold {
                continue;
            }

            let already_logged = ctx
                .db
                .has_recent_anomaly(
                    &record.symbol,
                    *timeframe,
                    AnomalyType::Stale,
                    chrono::Duration::hours(ANOMALY_DEDUP_HOURS),
                )
                .unwrap_or(false);
            if already_logged {
                continue;
            }

            let severity = staleness_severity(*timeframe);
            let description = format!(
                "latest candle {} is {}h old (threshold {}h)",
                latest.candle.time,
                age.num_hours(),
                threshold.num_hours()
            );
            if let Err(e) = ctx.db.log_anomaly(
                &record.symbol,
                Some(*timeframe),
                AnomalyType::Stale,
                severity,
                &description,
                0,
            ) {
                warn!(symbol = %record.symbol, error = %e, "failed to log staleness");
                continue;
            }
            found += 1;

            if severity >= AnomalySeverity::High {
                ctx.alerts.raise(
                    AlertKind::DataStale,
                    AlertSeverity::Warning,
                    format!("{} {} is stale: {}", record.symbol, timeframe.as_str(), description),
                    Some(json!({"symbol": record.symbol, "timeframe": timeframe.as_str()})),
                );
            }
        }
    }
    found
}

fn duplicate_sweep(ctx: &JobContext) -> usize {
    let duplicates = match ctx.db.find_duplicate_keys() {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "duplicate sweep failed");
            return 0;
        }
    };

    for (symbol, timeframe, time, count) in &duplicates {
        let tf = Timeframe::from_str(timeframe);
        if let Err(e) = ctx.db.log_anomaly(
            symbol,
            tf,
            AnomalyType::Duplicate,
            AnomalySeverity::Critical,
            &format!("{count} rows share key time={time}"),
            count - 1,
        ) {
            warn!(symbol, error = %e, "failed to log duplicate");
        }
    }
    duplicates.len()
}

fn outlier_sweep(ctx: &JobContext) -> usize {
    let outliers = match ctx
        .db
        .recent_outliers(OUTLIER_SCAN_HOURS, OUTLIER_MOVE_THRESHOLD)
    {
        Ok(o) => o,
        Err(e) => {
            warn!(error = %e, "outlier sweep failed");
            return 0;
        }
    };

    let mut found = 0usize;
    for stored in &outliers {
        let already_logged = ctx
            .db
            .has_recent_anomaly(
                &stored.symbol,
                stored.timeframe,
                AnomalyType::Outlier,
                chrono::Duration::hours(ANOMALY_DEDUP_HOURS),
            )
            .unwrap_or(false);
        if already_logged {
            continue;
        }

        let move_pct = if stored.candle.open != 0.0 {
            (stored.candle.close - stored.candle.open).abs() / stored.candle.open.abs() * 100.0
        } else {
            0.0
        };
        if let Err(e) = ctx.db.log_anomaly(
            &stored.symbol,
            Some(stored.timeframe),
            AnomalyType::Outlier,
            AnomalySeverity::Medium,
            &format!(
                "{:.1}% intrabar move at {}",
                move_pct, stored.candle.time
            ),
            1,
        ) {
            warn!(symbol = %stored.symbol, error = %e, "failed to log outlier");
            continue;
        }
        found += 1;
    }
    found
}

/// Dispatch alerts for symbols whose failure streak crossed the threshold.
fn failure_alert_sweep(ctx: &JobContext) {
    let pending = match ctx.db.symbols_needing_alert() {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "failure alert sweep failed");
            return;
        }
    };

    for record in &pending {
        ctx.alerts.raise(
            AlertKind::ConsecutiveFailures,
            AlertSeverity::Critical,
            format!(
                "{} has failed {} consecutive backfills",
                record.symbol, record.consecutive_failures
            ),
            Some(json!({
                "symbol": record.symbol,
                "consecutive_failures": record.consecutive_failures,
            })),
        );
        if let Err(e) = ctx.db.mark_alert_sent(&record.symbol) {
            warn!(symbol = %record.symbol, error = %e, "failed to stamp alert");
        }
    }
}

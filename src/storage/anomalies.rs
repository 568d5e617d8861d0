//! Append-only data-anomaly log.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tracing::warn;

use super::{from_ts, ts, WarehouseDb};
use crate::models::{AnomalySeverity, AnomalyType, DataAnomaly, Timeframe};

/// Filters for querying the anomaly log.
#[derive(Debug, Clone, Default)]
pub struct AnomalyFilter {
    pub symbol: Option<String>,
    pub severity: Option<AnomalySeverity>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

fn anomaly_from_row(row: &Row<'_>) -> rusqlite::Result<DataAnomaly> {
    let timeframe: Option<String> = row.get(2)?;
    let anomaly_type: String = row.get(3)?;
    let severity: String = row.get(4)?;
    Ok(DataAnomaly {
        id: row.get(0)?,
        symbol: row.get(1)?,
        timeframe: timeframe.and_then(|tf| Timeframe::from_str(&tf)),
        anomaly_type: AnomalyType::from_str(&anomaly_type).unwrap_or(AnomalyType::Outlier),
        severity: AnomalySeverity::from_str(&severity).unwrap_or(AnomalySeverity::Low),
        description: row.get(5)?,
        affected_rows: row.get(6)?,
        resolution_status: row.get(7)?,
        detected_at: from_ts(row.get(8)?),
    })
}

impl WarehouseDb {
    pub fn log_anomaly(
        &self,
        symbol: &str,
        timeframe: Option<Timeframe>,
        anomaly_type: AnomalyType,
        severity: AnomalySeverity,
        description: &str,
        affected_rows: i64,
    ) -> Result<()> {
        warn!(
            symbol,
            anomaly = anomaly_type.as_str(),
            severity = severity.as_str(),
            description,
            "data anomaly recorded"
        );
        self.conn().execute(
            "INSERT INTO data_anomalies
                (symbol, timeframe, anomaly_type, severity, description,
                 affected_rows, resolution_status, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7)",
            params![
                symbol,
                timeframe.map(|tf| tf.as_str()),
                anomaly_type.as_str(),
                severity.as_str(),
                description,
                affected_rows,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn query_anomalies(&self, filter: &AnomalyFilter) -> Result<Vec<DataAnomaly>> {
        let mut sql = String::from(
            "SELECT id, symbol, timeframe, anomaly_type, severity, description,
                    affected_rows, resolution_status, detected_at
             FROM data_anomalies WHERE 1=1",
        );
        let mut params: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(symbol) = &filter.symbol {
            params.push(symbol.clone().into());
            sql.push_str(&format!(" AND symbol = ?{}", params.len()));
        }
        if let Some(severity) = filter.severity {
            params.push(severity.as_str().to_string().into());
            sql.push_str(&format!(" AND severity = ?{}", params.len()));
        }
        if let Some(since) = filter.since {
            params.push(ts(since).into());
            sql.push_str(&format!(" AND detected_at >= ?{}", params.len()));
        }
        sql.push_str(" ORDER BY detected_at DESC");
        sql.push_str(&format!(" LIMIT {}", filter.limit.unwrap_or(500)));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), anomaly_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Whether a stale anomaly for this pair was already recorded recently;
    /// keeps the 6-hourly monitor from flooding the log.
    pub fn has_recent_anomaly(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        anomaly_type: AnomalyType,
        within: chrono::Duration,
    ) -> Result<bool> {
        let cutoff = ts(Utc::now() - within);
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM data_anomalies
             WHERE symbol = ?1 AND timeframe = ?2 AND anomaly_type = ?3
               AND detected_at >= ?4",
            params![symbol, timeframe.as_str(), anomaly_type.as_str(), cutoff],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn total_anomalies(&self) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row("SELECT COUNT(*) FROM data_anomalies", [], |r| r.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_util::temp_db;

    #[test]
    fn log_and_filter() {
        let (db, _f) = temp_db();
        db.log_anomaly(
            "AAPL",
            Some(Timeframe::D1),
            AnomalyType::Stale,
            AnomalySeverity::High,
            "no candle since 2024-01-02",
            0,
        )
        .unwrap();
        db.log_anomaly(
            "MSFT",
            Some(Timeframe::H1),
            AnomalyType::Outlier,
            AnomalySeverity::Low,
            "22% intrabar move",
            1,
        )
        .unwrap();

        let all = db.query_anomalies(&AnomalyFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let aapl = db
            .query_anomalies(&AnomalyFilter {
                symbol: Some("AAPL".to_string()),
                ..AnomalyFilter::default()
            })
            .unwrap();
        assert_eq!(aapl.len(), 1);
        assert_eq!(aapl[0].anomaly_type, AnomalyType::Stale);
        assert_eq!(aapl[0].resolution_status, "open");

        let high = db
            .query_anomalies(&AnomalyFilter {
                severity: Some(AnomalySeverity::High),
                ..AnomalyFilter::default()
            })
            .unwrap();
        assert_eq!(high.len(), 1);
    }

    #[test]
    fn recent_anomaly_dedup_window() {
        let (db, _f) = temp_db();
        assert!(!db
            .has_recent_anomaly("AAPL", Timeframe::D1, AnomalyType::Stale, chrono::Duration::hours(6))
            .unwrap());

        db.log_anomaly(
            "AAPL",
            Some(Timeframe::D1),
            AnomalyType::Stale,
            AnomalySeverity::Medium,
            "stale",
            0,
        )
        .unwrap();

        assert!(db
            .has_recent_anomaly("AAPL", Timeframe::D1, AnomalyType::Stale, chrono::Duration::hours(6))
            .unwrap());
        // Different type is independent.
        assert!(!db
            .has_recent_anomaly("AAPL", Timeframe::D1, AnomalyType::Gap, chrono::Duration::hours(6))
            .unwrap());
    }
}

//! Candle store: batch ingestion, range queries, feature upserts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;
use tracing::{debug, warn};

use super::{from_ts, ts, WarehouseDb};
use crate::features::{
    CompressionRegime, FeatureRow, StructureLabel, TrendDirection, TrendRegime, VolatilityRegime,
};
use crate::models::{Candle, DataSource, StoredCandle, Timeframe};
use crate::validation::ValidationOutcome;

/// Options for a range query.
#[derive(Debug, Clone, Default)]
pub struct CandleQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub validated_only: bool,
    pub min_quality: Option<f64>,
    pub limit: Option<usize>,
}

/// Result of one batch insert.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOutcome {
    pub inserted: usize,
    /// Rows dropped for violating the structural candle invariant.
    pub skipped_integrity: usize,
}

/// A stored candle joined with its derived feature columns.
#[derive(Debug, Clone, Serialize)]
pub struct CandleWithFeatures {
    #[serde(flatten)]
    pub stored: StoredCandle,
    #[serde(flatten)]
    pub features: FeatureRow,
    pub features_computed_at: Option<DateTime<Utc>>,
}

/// A row may enter the store only if its OHLC geometry is coherent.
fn passes_integrity(c: &Candle) -> bool {
    c.low <= c.open.min(c.close) && c.open.max(c.close) <= c.high && c.volume >= 0.0
}

impl WarehouseDb {
    /// Insert a validated batch in one transaction. Conflicts on
    /// (time, symbol, timeframe) are ignored so reruns are idempotent; rows
    /// breaking the structural invariant are skipped and counted.
    pub fn insert_candle_batch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        batch: &[(Candle, ValidationOutcome)],
        source: DataSource,
        trace_id: &str,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        if batch.is_empty() {
            return Ok(outcome);
        }

        let fetched_at = ts(Utc::now());
        let mut conn = self.conn();
        let tx = conn.transaction().context("begin candle batch")?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO market_data (
                    time, symbol, timeframe, open, high, low, close, volume,
                    source, validated, quality_score, validation_notes,
                    gap_detected, volume_anomaly, fetched_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT (time, symbol, timeframe) DO NOTHING",
            )?;

            for (candle, validation) in batch {
                if !passes_integrity(candle) {
                    warn!(
                        trace_id,
                        symbol,
                        time = %candle.time,
                        "skipping candle with broken OHLC geometry"
                    );
                    outcome.skipped_integrity += 1;
                    continue;
                }

                let changed = stmt.execute(params![
                    ts(candle.time),
                    symbol,
                    timeframe.as_str(),
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                    source.as_str(),
                    validation.validated as i64,
                    validation.quality_score,
                    validation.notes,
                    validation.gap_detected as i64,
                    validation.volume_anomaly as i64,
                    fetched_at,
                ])?;
                outcome.inserted += changed;
            }
        }
        tx.commit().context("commit candle batch")?;

        debug!(
            trace_id,
            symbol,
            timeframe = timeframe.as_str(),
            inserted = outcome.inserted,
            skipped = outcome.skipped_integrity,
            "candle batch persisted"
        );
        Ok(outcome)
    }

    /// Candles for a (symbol, timeframe) ordered ascending by time.
    pub fn query_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        query: &CandleQuery,
    ) -> Result<Vec<StoredCandle>> {
        let (sql, params) = build_range_sql(
            "SELECT time, symbol, timeframe, open, high, low, close, volume, source,
                    validated, quality_score, validation_notes, gap_detected,
                    volume_anomaly, fetched_at
             FROM market_data",
            symbol,
            timeframe,
            query,
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), stored_candle_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Candles joined with feature columns, ascending by time.
    pub fn query_candles_with_features(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        query: &CandleQuery,
    ) -> Result<Vec<CandleWithFeatures>> {
        let (sql, params) = build_range_sql(
            "SELECT time, symbol, timeframe, open, high, low, close, volume, source,
                    validated, quality_score, validation_notes, gap_detected,
                    volume_anomaly, fetched_at,
                    log_return, return_1d, return_1h, volatility_20, volatility_50,
                    atr_14, rolling_volume_20, volume_ratio, hh, hl, lh, ll,
                    trend_direction, structure_label, volatility_regime,
                    trend_regime, compression_regime, features_computed_at
             FROM market_data",
            symbol,
            timeframe,
            query,
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                let stored = stored_candle_from_row(row)?;
                let features = feature_row_from_row(row, 15)?;
                let features_computed_at: Option<i64> = row.get(32)?;
                Ok(CandleWithFeatures {
                    stored,
                    features,
                    features_computed_at: features_computed_at.map(from_ts),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Last `n` candles for a pair, returned in ascending time order.
    pub fn recent_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        n: usize,
    ) -> Result<Vec<StoredCandle>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT time, symbol, timeframe, open, high, low, close, volume, source,
                    validated, quality_score, validation_notes, gap_detected,
                    volume_anomaly, fetched_at
             FROM market_data
             WHERE symbol = ?1 AND timeframe = ?2
             ORDER BY time DESC LIMIT ?3",
        )?;
        let mut rows = stmt
            .query_map(
                params![symbol, timeframe.as_str(), n as i64],
                stored_candle_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// Most recent candle strictly before `time`.
    pub fn candle_before(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        time: DateTime<Utc>,
    ) -> Result<Option<StoredCandle>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT time, symbol, timeframe, open, high, low, close, volume, source,
                    validated, quality_score, validation_notes, gap_detected,
                    volume_anomaly, fetched_at
             FROM market_data
             WHERE symbol = ?1 AND timeframe = ?2 AND time < ?3
             ORDER BY time DESC LIMIT 1",
        )?;
        match stmt.query_row(
            params![symbol, timeframe.as_str(), ts(time)],
            stored_candle_from_row,
        ) {
            Ok(candle) => Ok(Some(candle)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Most recent candle for a pair.
    pub fn latest_candle(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<StoredCandle>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT time, symbol, timeframe, open, high, low, close, volume, source,
                    validated, quality_score, validation_notes, gap_detected,
                    volume_anomaly, fetched_at
             FROM market_data
             WHERE symbol = ?1 AND timeframe = ?2
             ORDER BY time DESC LIMIT 1",
        )?;
        match stmt.query_row(params![symbol, timeframe.as_str()], stored_candle_from_row) {
            Ok(candle) => Ok(Some(candle)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write feature columns for existing rows, never touching OHLCV. Rows
    /// without a matching key are ignored.
    pub fn upsert_features(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        rows: &[(DateTime<Utc>, FeatureRow)],
        trace_id: &str,
    ) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let computed_at = ts(Utc::now());
        let mut updated = 0usize;

        let mut conn = self.conn();
        let tx = conn.transaction().context("begin feature upsert")?;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE market_data SET
                    log_return = ?4, return_1d = ?5, return_1h = ?6,
                    volatility_20 = ?7, volatility_50 = ?8, atr_14 = ?9,
                    rolling_volume_20 = ?10, volume_ratio = ?11,
                    hh = ?12, hl = ?13, lh = ?14, ll = ?15,
                    trend_direction = ?16, structure_label = ?17,
                    volatility_regime = ?18, trend_regime = ?19,
                    compression_regime = ?20, features_computed_at = ?21
                 WHERE time = ?1 AND symbol = ?2 AND timeframe = ?3",
            )?;

            for (time, f) in rows {
                updated += stmt.execute(params![
                    ts(*time),
                    symbol,
                    timeframe.as_str(),
                    f.log_return,
                    f.return_1d,
                    f.return_1h,
                    f.volatility_20,
                    f.volatility_50,
                    f.atr_14,
                    f.rolling_volume_20,
                    f.volume_ratio,
                    f.hh.map(|b| b as i64),
                    f.hl.map(|b| b as i64),
                    f.lh.map(|b| b as i64),
                    f.ll.map(|b| b as i64),
                    f.trend_direction.map(|v| v.as_str()),
                    f.structure_label.map(|v| v.as_str()),
                    f.volatility_regime.map(|v| v.as_str()),
                    f.trend_regime.map(|v| v.as_str()),
                    f.compression_regime.map(|v| v.as_str()),
                    computed_at,
                ])?;
            }
        }
        tx.commit().context("commit feature upsert")?;

        debug!(
            trace_id,
            symbol,
            timeframe = timeframe.as_str(),
            updated,
            "feature columns upserted"
        );
        Ok(updated)
    }

    /// Record one feature-engine run.
    pub fn log_feature_run(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        window_size: usize,
        records_updated: usize,
        outcome: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO feature_run_log
                (symbol, timeframe, window_size, records_updated, outcome, error_message, ran_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                symbol,
                timeframe.as_str(),
                window_size as i64,
                records_updated as i64,
                outcome,
                error_message,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn total_candles(&self) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row("SELECT COUNT(*) FROM market_data", [], |r| r.get(0))?;
        Ok(count)
    }

    /// Fraction of stored candles marked validated; `None` on an empty store.
    pub fn validation_rate(&self) -> Result<Option<f64>> {
        let conn = self.conn();
        let (total, validated): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(validated), 0) FROM market_data",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        if total == 0 {
            Ok(None)
        } else {
            Ok(Some(validated as f64 / total as f64))
        }
    }

    /// (symbol, timeframe, time) keys holding more than one row. Impossible
    /// under the primary key, kept as a monitor guard.
    pub fn find_duplicate_keys(&self) -> Result<Vec<(String, String, i64, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT symbol, timeframe, time, COUNT(*) AS n FROM market_data
             GROUP BY symbol, timeframe, time HAVING n > 1",
        )?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Candles fetched within the last `hours` whose intrabar move exceeds
    /// `threshold` (|close-open|/open).
    pub fn recent_outliers(&self, hours: i64, threshold: f64) -> Result<Vec<StoredCandle>> {
        let cutoff = ts(Utc::now() - chrono::Duration::hours(hours));
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT time, symbol, timeframe, open, high, low, close, volume, source,
                    validated, quality_score, validation_notes, gap_detected,
                    volume_anomaly, fetched_at
             FROM market_data
             WHERE fetched_at >= ?1 AND open != 0
               AND ABS(close - open) / ABS(open) > ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, threshold], stored_candle_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn build_range_sql(
    select: &str,
    symbol: &str,
    timeframe: Timeframe,
    query: &CandleQuery,
) -> (String, Vec<rusqlite::types::Value>) {
    let mut sql = format!("{select} WHERE symbol = ?1 AND timeframe = ?2");
    let mut params: Vec<rusqlite::types::Value> = vec![
        symbol.to_string().into(),
        timeframe.as_str().to_string().into(),
    ];

    if let Some(start) = query.start {
        params.push(ts(start).into());
        sql.push_str(&format!(" AND time >= ?{}", params.len()));
    }
    if let Some(end) = query.end {
        params.push(ts(end).into());
        sql.push_str(&format!(" AND time < ?{}", params.len()));
    }
    if query.validated_only {
        sql.push_str(" AND validated = 1");
    }
    if let Some(min_quality) = query.min_quality {
        params.push(min_quality.into());
        sql.push_str(&format!(" AND quality_score >= ?{}", params.len()));
    }
    sql.push_str(" ORDER BY time ASC");
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    (sql, params)
}

fn stored_candle_from_row(row: &Row<'_>) -> rusqlite::Result<StoredCandle> {
    let timeframe: String = row.get(2)?;
    let source: String = row.get(8)?;
    Ok(StoredCandle {
        symbol: row.get(1)?,
        timeframe: Timeframe::from_str(&timeframe).unwrap_or(Timeframe::D1),
        candle: Candle {
            time: from_ts(row.get(0)?),
            open: row.get(3)?,
            high: row.get(4)?,
            low: row.get(5)?,
            close: row.get(6)?,
            volume: row.get(7)?,
        },
        source: DataSource::from_str(&source).unwrap_or(DataSource::Primary),
        validated: row.get::<_, i64>(9)? != 0,
        quality_score: row.get(10)?,
        validation_notes: row.get(11)?,
        gap_detected: row.get::<_, i64>(12)? != 0,
        volume_anomaly: row.get::<_, i64>(13)? != 0,
        fetched_at: from_ts(row.get(14)?),
    })
}

fn feature_row_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<FeatureRow> {
    let get_label = |idx: usize| -> rusqlite::Result<Option<String>> { row.get(offset + idx) };
    Ok(FeatureRow {
        log_return: row.get(offset)?,
        return_1d: row.get(offset + 1)?,
        return_1h: row.get(offset + 2)?,
        volatility_20: row.get(offset + 3)?,
        volatility_50: row.get(offset + 4)?,
        atr_14: row.get(offset + 5)?,
        rolling_volume_20: row.get(offset + 6)?,
        volume_ratio: row.get(offset + 7)?,
        hh: row.get::<_, Option<i64>>(offset + 8)?.map(|v| v != 0),
        hl: row.get::<_, Option<i64>>(offset + 9)?.map(|v| v != 0),
        lh: row.get::<_, Option<i64>>(offset + 10)?.map(|v| v != 0),
        ll: row.get::<_, Option<i64>>(offset + 11)?.map(|v| v != 0),
        trend_direction: get_label(12)?.and_then(|s| TrendDirection::from_str(&s)),
        structure_label: get_label(13)?.and_then(|s| StructureLabel::from_str(&s)),
        volatility_regime: get_label(14)?.and_then(|s| VolatilityRegime::from_str(&s)),
        trend_regime: get_label(15)?.and_then(|s| TrendRegime::from_str(&s)),
        compression_regime: get_label(16)?.and_then(|s| CompressionRegime::from_str(&s)),
    })
}

//! Per-symbol consecutive-failure tracking.
//!
//! One upserted row per symbol. Three consecutive failures arm an alert; a
//! success resets the counter and disarms it.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{from_ts, ts, WarehouseDb};

/// Failures in a row before the monitor alerts.
pub const ALERT_FAILURE_THRESHOLD: i64 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub symbol: String,
    pub consecutive_failures: i64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub alert_sent: bool,
    pub alert_sent_at: Option<DateTime<Utc>>,
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<FailureRecord> {
    Ok(FailureRecord {
        symbol: row.get(0)?,
        consecutive_failures: row.get(1)?,
        last_failure_at: row.get::<_, Option<i64>>(2)?.map(from_ts),
        last_success_at: row.get::<_, Option<i64>>(3)?.map(from_ts),
        alert_sent: row.get::<_, i64>(4)? != 0,
        alert_sent_at: row.get::<_, Option<i64>>(5)?.map(from_ts),
    })
}

const FAILURE_COLUMNS: &str =
    "symbol, consecutive_failures, last_failure_at, last_success_at, alert_sent, alert_sent_at";

impl WarehouseDb {
    /// Reset the failure streak after a successful backfill.
    pub fn mark_symbol_success(&self, symbol: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO symbol_failure_tracking
                (symbol, consecutive_failures, last_success_at, alert_sent)
             VALUES (?1, 0, ?2, 0)
             ON CONFLICT (symbol) DO UPDATE SET
                consecutive_failures = 0, last_success_at = excluded.last_success_at,
                alert_sent = 0, alert_sent_at = NULL",
            params![symbol, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Bump the failure streak. Returns true when the streak has reached the
    /// alert threshold and no alert has been sent yet.
    pub fn mark_symbol_failure(&self, symbol: &str) -> Result<bool> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO symbol_failure_tracking
                (symbol, consecutive_failures, last_failure_at)
             VALUES (?1, 1, ?2)
             ON CONFLICT (symbol) DO UPDATE SET
                consecutive_failures = consecutive_failures + 1,
                last_failure_at = excluded.last_failure_at",
            params![symbol, ts(Utc::now())],
        )?;

        let (failures, alert_sent): (i64, i64) = conn.query_row(
            "SELECT consecutive_failures, alert_sent FROM symbol_failure_tracking
             WHERE symbol = ?1",
            params![symbol],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(failures >= ALERT_FAILURE_THRESHOLD && alert_sent == 0)
    }

    /// Stamp that an alert went out for this symbol's streak.
    pub fn mark_alert_sent(&self, symbol: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE symbol_failure_tracking SET alert_sent = 1, alert_sent_at = ?2
             WHERE symbol = ?1",
            params![symbol, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn get_failure_record(&self, symbol: &str) -> Result<Option<FailureRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("SELECT {FAILURE_COLUMNS} FROM symbol_failure_tracking WHERE symbol = ?1"),
                params![symbol],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Symbols at or past the alert threshold that have not been alerted.
    pub fn symbols_needing_alert(&self) -> Result<Vec<FailureRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FAILURE_COLUMNS} FROM symbol_failure_tracking
             WHERE consecutive_failures >= ?1 AND alert_sent = 0"
        ))?;
        let rows = stmt
            .query_map(params![ALERT_FAILURE_THRESHOLD], record_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

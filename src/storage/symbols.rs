//! Symbol registry.
//!
//! Symbols are soft-deleted by clearing `active`; rows are never removed so
//! the audit trail of what was ever tracked survives.

use anyhow::{bail, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::info;

use super::{from_ts, ts, WarehouseDb};
use crate::models::{AssetClass, SymbolRecord, Timeframe};

fn join_timeframes(timeframes: &[Timeframe]) -> String {
    if timeframes.is_empty() {
        // An empty set defaults to daily.
        return Timeframe::D1.as_str().to_string();
    }
    timeframes
        .iter()
        .map(|tf| tf.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn split_timeframes(raw: &str) -> Vec<Timeframe> {
    let parsed: Vec<Timeframe> = raw
        .split(',')
        .filter_map(|code| Timeframe::from_str(code.trim()))
        .collect();
    if parsed.is_empty() {
        vec![Timeframe::D1]
    } else {
        parsed
    }
}

fn symbol_from_row(row: &Row<'_>) -> rusqlite::Result<SymbolRecord> {
    let asset_class: String = row.get(1)?;
    let timeframes: String = row.get(3)?;
    Ok(SymbolRecord {
        symbol: row.get(0)?,
        asset_class: AssetClass::from_str(&asset_class).unwrap_or(AssetClass::Stock),
        active: row.get::<_, i64>(2)? != 0,
        timeframes: split_timeframes(&timeframes),
        last_backfill: row.get::<_, Option<i64>>(4)?.map(from_ts),
        backfill_status: row.get(5)?,
    })
}

const SYMBOL_COLUMNS: &str =
    "symbol, asset_class, active, timeframes, last_backfill, backfill_status";

impl WarehouseDb {
    /// Register a symbol. Re-creating an existing symbol reactivates it and
    /// refreshes its asset class and timeframes.
    pub fn create_symbol(
        &self,
        symbol: &str,
        asset_class: AssetClass,
        timeframes: &[Timeframe],
    ) -> Result<SymbolRecord> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            bail!("symbol must not be empty");
        }

        self.conn().execute(
            "INSERT INTO tracked_symbols (symbol, asset_class, active, timeframes, created_at)
             VALUES (?1, ?2, 1, ?3, ?4)
             ON CONFLICT (symbol) DO UPDATE SET
                active = 1, asset_class = excluded.asset_class,
                timeframes = excluded.timeframes",
            params![
                symbol,
                asset_class.as_str(),
                join_timeframes(timeframes),
                ts(Utc::now()),
            ],
        )?;

        info!(%symbol, asset_class = asset_class.as_str(), "symbol registered");
        self.get_symbol(&symbol)?
            .ok_or_else(|| anyhow::anyhow!("symbol {symbol} vanished after insert"))
    }

    /// Soft delete: the row stays, `active` is cleared.
    pub fn deactivate_symbol(&self, symbol: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE tracked_symbols SET active = 0 WHERE symbol = ?1",
            params![symbol],
        )?;
        if changed > 0 {
            info!(symbol, "symbol deactivated");
        }
        Ok(changed > 0)
    }

    pub fn get_symbol(&self, symbol: &str) -> Result<Option<SymbolRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("SELECT {SYMBOL_COLUMNS} FROM tracked_symbols WHERE symbol = ?1"),
                params![symbol],
                symbol_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_active_symbols(&self) -> Result<Vec<SymbolRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SYMBOL_COLUMNS} FROM tracked_symbols WHERE active = 1 ORDER BY symbol"
        ))?;
        let rows = stmt
            .query_map([], symbol_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_all_symbols(&self) -> Result<Vec<SymbolRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SYMBOL_COLUMNS} FROM tracked_symbols ORDER BY symbol"
        ))?;
        let rows = stmt
            .query_map([], symbol_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Replace a symbol's timeframe set. The set must already be vetted
    /// against the allowed list by the caller.
    pub fn update_symbol_timeframes(&self, symbol: &str, timeframes: &[Timeframe]) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE tracked_symbols SET timeframes = ?2 WHERE symbol = ?1",
            params![symbol, join_timeframes(timeframes)],
        )?;
        Ok(changed > 0)
    }

    /// Stamp the outcome of the latest backfill touching this symbol.
    pub fn record_backfill_outcome(&self, symbol: &str, status: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE tracked_symbols SET last_backfill = ?2, backfill_status = ?3
             WHERE symbol = ?1",
            params![symbol, ts(Utc::now()), status],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_util::temp_db;

    #[test]
    fn create_and_list_round_trip() {
        let (db, _f) = temp_db();
        db.create_symbol("aapl", AssetClass::Stock, &[Timeframe::D1, Timeframe::H1])
            .unwrap();
        db.create_symbol("BTC", AssetClass::Crypto, &[]).unwrap();

        let active = db.list_active_symbols().unwrap();
        assert_eq!(active.len(), 2);
        // Symbols are upper-cased on the way in.
        assert_eq!(active[0].symbol, "AAPL");
        assert_eq!(active[0].timeframes, vec![Timeframe::D1, Timeframe::H1]);
        // Empty timeframe set defaults to daily.
        assert_eq!(active[1].timeframes, vec![Timeframe::D1]);
    }

    #[test]
    fn deactivate_is_soft() {
        let (db, _f) = temp_db();
        db.create_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
            .unwrap();
        assert!(db.deactivate_symbol("AAPL").unwrap());

        assert!(db.list_active_symbols().unwrap().is_empty());
        // Row survives for audit.
        let record = db.get_symbol("AAPL").unwrap().unwrap();
        assert!(!record.active);
        assert_eq!(db.list_all_symbols().unwrap().len(), 1);
    }

    #[test]
    fn recreate_reactivates() {
        let (db, _f) = temp_db();
        db.create_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
            .unwrap();
        db.deactivate_symbol("AAPL").unwrap();
        db.create_symbol("AAPL", AssetClass::Etf, &[Timeframe::W1])
            .unwrap();

        let record = db.get_symbol("AAPL").unwrap().unwrap();
        assert!(record.active);
        assert_eq!(record.asset_class, AssetClass::Etf);
        assert_eq!(record.timeframes, vec![Timeframe::W1]);
    }

    #[test]
    fn empty_symbol_is_rejected() {
        let (db, _f) = temp_db();
        assert!(db.create_symbol("  ", AssetClass::Stock, &[]).is_err());
    }

    #[test]
    fn backfill_outcome_is_stamped() {
        let (db, _f) = temp_db();
        db.create_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
            .unwrap();
        db.record_backfill_outcome("AAPL", "completed").unwrap();
        let record = db.get_symbol("AAPL").unwrap().unwrap();
        assert_eq!(record.backfill_status.as_deref(), Some("completed"));
        assert!(record.last_backfill.is_some());
    }

    #[test]
    fn update_timeframes_replaces_set() {
        let (db, _f) = temp_db();
        db.create_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
            .unwrap();
        assert!(db
            .update_symbol_timeframes("AAPL", &[Timeframe::M5, Timeframe::H1])
            .unwrap());
        let record = db.get_symbol("AAPL").unwrap().unwrap();
        assert_eq!(record.timeframes, vec![Timeframe::M5, Timeframe::H1]);
        assert!(!db.update_symbol_timeframes("NOPE", &[Timeframe::D1]).unwrap());
    }
}

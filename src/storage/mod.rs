//! SQLite-backed warehouse persistence.
//!
//! One WAL-mode connection behind a fast mutex serves every component; each
//! operation borrows the connection for a single statement or transaction.
//! The schema keeps candles, the symbol registry, backfill execution state,
//! failure tracking, anomaly and feature logs, and API-key material (digests
//! only) in a single database file.

mod anomalies;
mod api_keys;
mod backfill;
mod candles;
mod failures;
mod symbols;

pub use anomalies::AnomalyFilter;
pub use api_keys::{ApiKeyRecord, AuditRow, CreatedApiKey};
pub use backfill::RunSummary;
pub use candles::{BatchOutcome, CandleQuery, CandleWithFeatures};
pub use failures::FailureRecord;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS market_data (
    time INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    source TEXT NOT NULL,
    validated INTEGER NOT NULL DEFAULT 0,
    quality_score REAL NOT NULL DEFAULT 0,
    validation_notes TEXT NOT NULL DEFAULT '',
    gap_detected INTEGER NOT NULL DEFAULT 0,
    volume_anomaly INTEGER NOT NULL DEFAULT 0,
    fetched_at INTEGER NOT NULL,
    log_return REAL,
    return_1d REAL,
    return_1h REAL,
    volatility_20 REAL,
    volatility_50 REAL,
    atr_14 REAL,
    rolling_volume_20 REAL,
    volume_ratio REAL,
    hh INTEGER,
    hl INTEGER,
    lh INTEGER,
    ll INTEGER,
    trend_direction TEXT,
    structure_label TEXT,
    volatility_regime TEXT,
    trend_regime TEXT,
    compression_regime TEXT,
    features_computed_at INTEGER,
    PRIMARY KEY (time, symbol, timeframe)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_market_data_lookup
    ON market_data(symbol, timeframe, time DESC);

CREATE TABLE IF NOT EXISTS tracked_symbols (
    symbol TEXT PRIMARY KEY,
    asset_class TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    timeframes TEXT NOT NULL DEFAULT '1d',
    last_backfill INTEGER,
    backfill_status TEXT,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS backfill_state_persistent (
    execution_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    records_inserted INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_backfill_state_status
    ON backfill_state_persistent(status, started_at);

CREATE TABLE IF NOT EXISTS backfill_run_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trace_id TEXT NOT NULL,
    trigger TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    symbols_processed INTEGER NOT NULL DEFAULT 0,
    pairs_succeeded INTEGER NOT NULL DEFAULT 0,
    pairs_failed INTEGER NOT NULL DEFAULT 0,
    records_inserted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS data_anomalies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timeframe TEXT,
    anomaly_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    description TEXT NOT NULL,
    affected_rows INTEGER NOT NULL DEFAULT 0,
    resolution_status TEXT NOT NULL DEFAULT 'open',
    detected_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_anomalies_symbol
    ON data_anomalies(symbol, detected_at DESC);

CREATE TABLE IF NOT EXISTS symbol_failure_tracking (
    symbol TEXT PRIMARY KEY,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_failure_at INTEGER,
    last_success_at INTEGER,
    alert_sent INTEGER NOT NULL DEFAULT 0,
    alert_sent_at INTEGER
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS api_keys (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    hash TEXT UNIQUE NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    request_count INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS api_key_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key_id TEXT,
    endpoint TEXT NOT NULL,
    outcome TEXT NOT NULL,
    remote_ip TEXT,
    at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS feature_run_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    window_size INTEGER NOT NULL,
    records_updated INTEGER NOT NULL DEFAULT 0,
    outcome TEXT NOT NULL,
    error_message TEXT,
    ran_at INTEGER NOT NULL
);
"#;

/// Shared handle over the warehouse database.
#[derive(Clone)]
pub struct WarehouseDb {
    conn: Arc<Mutex<Connection>>,
}

impl WarehouseDb {
    /// Open (or create) the database at `path` and apply schema + pragmas.
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open warehouse db at {path}"))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", -64_000)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply warehouse schema")?;

        info!(path, "warehouse database ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

/// Epoch seconds for storage columns.
pub(crate) fn ts(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

/// Storage column back to UTC. Out-of-range values clamp to the epoch rather
/// than panicking on corrupt rows.
pub(crate) fn from_ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::WarehouseDb;
    use tempfile::NamedTempFile;

    /// A fresh database in a temp file, kept alive by the returned handle.
    pub fn temp_db() -> (WarehouseDb, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let db = WarehouseDb::new(file.path().to_str().unwrap()).unwrap();
        (db, file)
    }
}

//! Backfill execution state and run history.
//!
//! Each (symbol, timeframe) attempt gets its own execution id; status only
//! ever advances pending -> in_progress -> {completed, failed}, and terminal
//! rows are never mutated again. A new run always creates a new id.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{from_ts, ts, WarehouseDb};
use crate::models::{BackfillState, BackfillStatus, Timeframe};

/// Aggregate outcome of one scheduled (or ad-hoc) backfill run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub trace_id: String,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub symbols_processed: i64,
    pub pairs_succeeded: i64,
    pub pairs_failed: i64,
    pub records_inserted: i64,
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<BackfillState> {
    let execution_id: String = row.get(0)?;
    let timeframe: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(BackfillState {
        execution_id: Uuid::parse_str(&execution_id).unwrap_or_default(),
        symbol: row.get(1)?,
        timeframe: Timeframe::from_str(&timeframe).unwrap_or(Timeframe::D1),
        status: BackfillStatus::from_str(&status).unwrap_or(BackfillStatus::Failed),
        started_at: from_ts(row.get(4)?),
        completed_at: row.get::<_, Option<i64>>(5)?.map(from_ts),
        records_inserted: row.get(6)?,
        error_message: row.get(7)?,
        retry_count: row.get(8)?,
    })
}

const STATE_COLUMNS: &str = "execution_id, symbol, timeframe, status, started_at, completed_at,
    records_inserted, error_message, retry_count";

impl WarehouseDb {
    /// Open a new execution in `pending` and return its id.
    pub fn create_backfill_state(&self, symbol: &str, timeframe: Timeframe) -> Result<Uuid> {
        let execution_id = Uuid::new_v4();
        self.conn().execute(
            "INSERT INTO backfill_state_persistent
                (execution_id, symbol, timeframe, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                execution_id.to_string(),
                symbol,
                timeframe.as_str(),
                BackfillStatus::Pending.as_str(),
                ts(Utc::now()),
            ],
        )?;
        debug!(
            execution_id = %execution_id,
            symbol,
            timeframe = timeframe.as_str(),
            "backfill state created"
        );
        Ok(execution_id)
    }

    /// Advance an execution's status. Terminal states are frozen; moving into
    /// one stamps `completed_at`.
    pub fn update_backfill_state(
        &self,
        execution_id: Uuid,
        status: BackfillStatus,
        records_inserted: i64,
        error_message: Option<&str>,
    ) -> Result<()> {
        let current = self
            .get_backfill_state(execution_id)?
            .with_context(|| format!("unknown backfill execution {execution_id}"))?;

        if current.status.is_terminal() {
            bail!(
                "backfill execution {execution_id} already terminal ({})",
                current.status.as_str()
            );
        }

        let completed_at = status.is_terminal().then(|| ts(Utc::now()));
        self.conn().execute(
            "UPDATE backfill_state_persistent
             SET status = ?2, records_inserted = ?3, error_message = ?4,
                 completed_at = COALESCE(?5, completed_at)
             WHERE execution_id = ?1",
            params![
                execution_id.to_string(),
                status.as_str(),
                records_inserted,
                error_message,
                completed_at,
            ],
        )?;

        if status == BackfillStatus::Failed {
            warn!(
                execution_id = %execution_id,
                symbol = %current.symbol,
                error = error_message.unwrap_or("unknown"),
                "backfill execution failed"
            );
        }
        Ok(())
    }

    pub fn get_backfill_state(&self, execution_id: Uuid) -> Result<Option<BackfillState>> {
        let conn = self.conn();
        let state = conn
            .query_row(
                &format!(
                    "SELECT {STATE_COLUMNS} FROM backfill_state_persistent WHERE execution_id = ?1"
                ),
                params![execution_id.to_string()],
                state_from_row,
            )
            .optional()?;
        Ok(state)
    }

    /// Executions still pending or in progress.
    pub fn list_active_backfill_states(&self) -> Result<Vec<BackfillState>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM backfill_state_persistent
             WHERE status IN ('pending', 'in_progress')
             ORDER BY started_at"
        ))?;
        let rows = stmt
            .query_map([], state_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent executions, newest first.
    pub fn list_recent_backfill_states(&self, limit: usize) -> Result<Vec<BackfillState>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM backfill_state_persistent
             ORDER BY started_at DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], state_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Persist the summary of a finished run.
    pub fn record_run_summary(&self, summary: &RunSummary) -> Result<()> {
        self.conn().execute(
            "INSERT INTO backfill_run_history
                (trace_id, trigger, started_at, finished_at, symbols_processed,
                 pairs_succeeded, pairs_failed, records_inserted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                summary.trace_id,
                summary.trigger,
                ts(summary.started_at),
                summary.finished_at.map(ts),
                summary.symbols_processed,
                summary.pairs_succeeded,
                summary.pairs_failed,
                summary.records_inserted,
            ],
        )?;
        Ok(())
    }

    pub fn latest_run_summary(&self) -> Result<Option<RunSummary>> {
        let conn = self.conn();
        let summary = conn
            .query_row(
                "SELECT trace_id, trigger, started_at, finished_at, symbols_processed,
                        pairs_succeeded, pairs_failed, records_inserted
                 FROM backfill_run_history ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(RunSummary {
                        trace_id: row.get(0)?,
                        trigger: row.get(1)?,
                        started_at: from_ts(row.get(2)?),
                        finished_at: row.get::<_, Option<i64>>(3)?.map(from_ts),
                        symbols_processed: row.get(4)?,
                        pairs_succeeded: row.get(5)?,
                        pairs_failed: row.get(6)?,
                        records_inserted: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_util::temp_db;

    #[test]
    fn lifecycle_advances_to_terminal() {
        let (db, _f) = temp_db();
        let id = db.create_backfill_state("AAPL", Timeframe::D1).unwrap();

        let state = db.get_backfill_state(id).unwrap().unwrap();
        assert_eq!(state.status, BackfillStatus::Pending);
        assert!(state.completed_at.is_none());

        db.update_backfill_state(id, BackfillStatus::InProgress, 0, None)
            .unwrap();
        db.update_backfill_state(id, BackfillStatus::Completed, 42, None)
            .unwrap();

        let state = db.get_backfill_state(id).unwrap().unwrap();
        assert_eq!(state.status, BackfillStatus::Completed);
        assert_eq!(state.records_inserted, 42);
        assert!(state.completed_at.is_some());
    }

    #[test]
    fn terminal_states_are_frozen() {
        let (db, _f) = temp_db();
        let id = db.create_backfill_state("AAPL", Timeframe::D1).unwrap();
        db.update_backfill_state(id, BackfillStatus::Failed, 0, Some("boom"))
            .unwrap();

        // Any further transition is rejected.
        assert!(db
            .update_backfill_state(id, BackfillStatus::Completed, 1, None)
            .is_err());
        let state = db.get_backfill_state(id).unwrap().unwrap();
        assert_eq!(state.status, BackfillStatus::Failed);
        assert_eq!(state.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn active_listing_excludes_terminal_rows() {
        let (db, _f) = temp_db();
        let a = db.create_backfill_state("AAPL", Timeframe::D1).unwrap();
        let b = db.create_backfill_state("MSFT", Timeframe::D1).unwrap();
        db.update_backfill_state(a, BackfillStatus::Completed, 5, None)
            .unwrap();

        let active = db.list_active_backfill_states().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].execution_id, b);
    }

    #[test]
    fn run_summary_round_trips() {
        let (db, _f) = temp_db();
        assert!(db.latest_run_summary().unwrap().is_none());

        db.record_run_summary(&RunSummary {
            trace_id: "trace-1".to_string(),
            trigger: "scheduled".to_string(),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            symbols_processed: 3,
            pairs_succeeded: 5,
            pairs_failed: 1,
            records_inserted: 1200,
        })
        .unwrap();

        let latest = db.latest_run_summary().unwrap().unwrap();
        assert_eq!(latest.trace_id, "trace-1");
        assert_eq!(latest.records_inserted, 1200);
    }
}

//! Grouped parallel backfill workers.
//!
//! Symbols are partitioned into groups of `max_concurrent_symbols`. Groups
//! run in sequence; inside a group each symbol gets its own task, with
//! launches staggered to avoid bursting the upstream. Per (symbol, timeframe)
//! the pipeline is fetch -> validate -> insert, with every outcome persisted
//! as backfill execution state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use super::JobContext;
use crate::models::{
    AnomalySeverity, AnomalyType, AssetClass, BackfillStatus, Candle, SymbolRecord, Timeframe,
};
use crate::observability::new_trace_id;
use crate::storage::RunSummary;
use crate::upstream::{orchestrator::FetchOutcome, FetchOptions};
use crate::validation;

const STAGGER_SECS: u64 = 5;
const GROUP_PAUSE_MIN_SECS: u64 = 10;
const GROUP_PAUSE_MAX_SECS: u64 = 15;
/// Default lookback for the nightly run.
const SCHEDULED_LOOKBACK_DAYS: i64 = 7;
/// Volume history consulted for the anomaly baseline.
const MEDIAN_VOLUME_WINDOW: usize = 20;

/// One backfill run request, scheduled or ad-hoc.
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub trace_id: String,
    pub trigger: String,
    /// `None` backfills every active symbol from the registry.
    pub symbols: Option<Vec<String>>,
    /// `None` uses each symbol's registered timeframe set.
    pub timeframes: Option<Vec<Timeframe>>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BackfillRequest {
    pub fn scheduled() -> Self {
        let end = Utc::now();
        Self {
            trace_id: new_trace_id(),
            trigger: "scheduled".to_string(),
            symbols: None,
            timeframes: None,
            start: end - chrono::Duration::days(SCHEDULED_LOOKBACK_DAYS),
            end,
        }
    }

    pub fn adhoc(
        symbols: Vec<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframes: Option<Vec<Timeframe>>,
    ) -> Self {
        Self {
            trace_id: new_trace_id(),
            trigger: "adhoc".to_string(),
            symbols: Some(symbols),
            timeframes,
            start,
            end,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerTally {
    pairs_succeeded: i64,
    pairs_failed: i64,
    records_inserted: i64,
}

/// Execute one backfill run to completion and persist its summary.
pub async fn run_ohlcv_backfill(ctx: &Arc<JobContext>, request: BackfillRequest) -> RunSummary {
    let started_at = Utc::now();
    let trace_id = request.trace_id.clone();
    info!(
        %trace_id,
        trigger = %request.trigger,
        start = %request.start,
        end = %request.end,
        "backfill run starting"
    );

    let symbols = resolve_symbols(ctx, &request);
    let mut tally = WorkerTally::default();
    let symbols_processed = symbols.len() as i64;

    let groups: Vec<&[SymbolRecord]> = symbols.chunks(ctx.max_concurrent_symbols.max(1)).collect();
    let group_count = groups.len();
    for (group_index, group) in groups.into_iter().enumerate() {
        if ctx.stopped() {
            info!(%trace_id, "stop requested, no further groups launched");
            break;
        }

        if ctx.parallel_backfill {
            let mut handles = Vec::with_capacity(group.len());
            for (i, record) in group.iter().cloned().enumerate() {
                let ctx = ctx.clone();
                let request = request.clone();
                handles.push(tokio::spawn(async move {
                    // Stagger launches inside the group.
                    sleep(Duration::from_secs(STAGGER_SECS * i as u64)).await;
                    process_symbol(&ctx, &record, &request).await
                }));
            }
            for handle in handles {
                match handle.await {
                    Ok(t) => tally.merge(t),
                    Err(e) => warn!(%trace_id, error = %e, "backfill worker panicked"),
                }
            }
        } else {
            for record in group {
                if ctx.stopped() {
                    break;
                }
                tally.merge(process_symbol(ctx, record, &request).await);
            }
        }

        // Rate-limit headroom between groups.
        if group_index + 1 < group_count && !ctx.stopped() {
            let pause = rand::thread_rng().gen_range(GROUP_PAUSE_MIN_SECS..=GROUP_PAUSE_MAX_SECS);
            sleep(Duration::from_secs(pause)).await;
        }
    }

    let summary = RunSummary {
        trace_id: trace_id.clone(),
        trigger: request.trigger.clone(),
        started_at,
        finished_at: Some(Utc::now()),
        symbols_processed,
        pairs_succeeded: tally.pairs_succeeded,
        pairs_failed: tally.pairs_failed,
        records_inserted: tally.records_inserted,
    };

    if let Err(e) = ctx.db.record_run_summary(&summary) {
        warn!(%trace_id, error = %e, "failed to persist run summary");
    }
    let elapsed_ms = (Utc::now() - started_at).num_milliseconds() as f64;
    ctx.metrics
        .record("job:ohlcv_backfill", elapsed_ms, tally.pairs_failed > 0);

    info!(
        %trace_id,
        symbols = symbols_processed,
        succeeded = tally.pairs_succeeded,
        failed = tally.pairs_failed,
        records = tally.records_inserted,
        "backfill run summary"
    );
    summary
}

impl WorkerTally {
    fn merge(&mut self, other: WorkerTally) {
        self.pairs_succeeded += other.pairs_succeeded;
        self.pairs_failed += other.pairs_failed;
        self.records_inserted += other.records_inserted;
    }
}

/// The run's symbol list: explicit request symbols (registered or not), or
/// every active symbol in the registry.
fn resolve_symbols(ctx: &JobContext, request: &BackfillRequest) -> Vec<SymbolRecord> {
    match &request.symbols {
        Some(symbols) => symbols
            .iter()
            .map(|s| {
                let symbol = s.trim().to_uppercase();
                ctx.db
                    .get_symbol(&symbol)
                    .ok()
                    .flatten()
                    .unwrap_or(SymbolRecord {
                        symbol,
                        asset_class: AssetClass::Stock,
                        active: true,
                        timeframes: vec![Timeframe::D1],
                        last_backfill: None,
                        backfill_status: None,
                    })
            })
            .collect(),
        None => ctx.db.list_active_symbols().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load active symbols");
            Vec::new()
        }),
    }
}

/// Backfill every timeframe of one symbol, tracking the symbol-level outcome.
async fn process_symbol(
    ctx: &JobContext,
    record: &SymbolRecord,
    request: &BackfillRequest,
) -> WorkerTally {
    let mut tally = WorkerTally::default();
    let timeframes = request
        .timeframes
        .clone()
        .unwrap_or_else(|| record.timeframes.clone());

    for timeframe in timeframes {
        if ctx.stopped() {
            info!(
                symbol = %record.symbol,
                "stop requested, remaining timeframes skipped"
            );
            break;
        }
        match process_pair(ctx, record, timeframe, request).await {
            Ok(records) => {
                tally.pairs_succeeded += 1;
                tally.records_inserted += records;
            }
            Err(e) => {
                tally.pairs_failed += 1;
                warn!(
                    trace_id = %request.trace_id,
                    symbol = %record.symbol,
                    timeframe = timeframe.as_str(),
                    error = %e,
                    "pair backfill failed"
                );
            }
        }
    }

    let status = if tally.pairs_failed == 0 {
        if let Err(e) = ctx.db.mark_symbol_success(&record.symbol) {
            warn!(symbol = %record.symbol, error = %e, "failed to record success");
        }
        "completed"
    } else {
        match ctx.db.mark_symbol_failure(&record.symbol) {
            Ok(true) => info!(
                symbol = %record.symbol,
                "failure streak reached alert threshold"
            ),
            Ok(false) => {}
            Err(e) => warn!(symbol = %record.symbol, error = %e, "failed to record failure"),
        }
        "failed"
    };
    if let Err(e) = ctx.db.record_backfill_outcome(&record.symbol, status) {
        warn!(symbol = %record.symbol, error = %e, "failed to stamp symbol outcome");
    }
    tally
}

/// Fetch, validate, and insert one (symbol, timeframe) window. The execution
/// state row tracks every step; any error flips it to `failed`.
async fn process_pair(
    ctx: &JobContext,
    record: &SymbolRecord,
    timeframe: Timeframe,
    request: &BackfillRequest,
) -> Result<i64> {
    let execution_id = ctx
        .db
        .create_backfill_state(&record.symbol, timeframe)
        .context("create backfill state")?;
    ctx.db
        .update_backfill_state(execution_id, BackfillStatus::InProgress, 0, None)
        .context("mark in_progress")?;

    match backfill_pair_inner(ctx, record, timeframe, request).await {
        Ok(records) => {
            if ctx.stopped() {
                // The batch in flight was flushed; the run itself is cut short.
                ctx.db.update_backfill_state(
                    execution_id,
                    BackfillStatus::Failed,
                    records,
                    Some("cancelled"),
                )?;
                anyhow::bail!("cancelled");
            }
            ctx.db
                .update_backfill_state(execution_id, BackfillStatus::Completed, records, None)?;
            Ok(records)
        }
        Err(e) => {
            let _ = ctx.db.update_backfill_state(
                execution_id,
                BackfillStatus::Failed,
                0,
                Some(&e.to_string()),
            );
            Err(e)
        }
    }
}

async fn backfill_pair_inner(
    ctx: &JobContext,
    record: &SymbolRecord,
    timeframe: Timeframe,
    request: &BackfillRequest,
) -> Result<i64> {
    let outcome = ctx
        .orchestrator
        .fetch_range_detailed(
            &record.symbol,
            timeframe,
            request.start,
            request.end,
            record.asset_class,
            FetchOptions::default(),
        )
        .await;

    let (candles, source) = match outcome {
        FetchOutcome::Data(candles, source) => (candles, source),
        // A reachable upstream with no bars is a clean zero-record window.
        FetchOutcome::Empty => return Ok(0),
        FetchOutcome::Failed(reason) => anyhow::bail!("all upstream sources failed: {reason}"),
    };

    let scored = validate_batch(ctx, &record.symbol, timeframe, &candles)?;
    let batch = ctx
        .db
        .insert_candle_batch(&record.symbol, timeframe, &scored, source, &request.trace_id)
        .context("insert candle batch")?;

    if batch.skipped_integrity > 0 {
        ctx.db.log_anomaly(
            &record.symbol,
            Some(timeframe),
            AnomalyType::Outlier,
            AnomalySeverity::High,
            "dropped candles with inconsistent OHLC geometry",
            batch.skipped_integrity as i64,
        )?;
    }

    Ok(batch.inserted as i64)
}

/// Score every candle in the batch, chaining the previous close through it
/// and seeding context from what the store already holds.
fn validate_batch(
    ctx: &JobContext,
    symbol: &str,
    timeframe: Timeframe,
    candles: &[Candle],
) -> Result<Vec<(Candle, validation::ValidationOutcome)>> {
    let mut prev_close = match candles.first() {
        Some(first) => ctx
            .db
            .candle_before(symbol, timeframe, first.time)?
            .map(|stored| stored.candle.close),
        None => None,
    };

    let history = ctx.db.recent_candles(symbol, timeframe, MEDIAN_VOLUME_WINDOW)?;
    let volumes: Vec<f64> = history.iter().map(|c| c.candle.volume).collect();
    let median_volume = validation::median_volume(&volumes);

    let mut scored = Vec::with_capacity(candles.len());
    for candle in candles {
        let outcome = validation::score_candle(candle, prev_close, median_volume);
        prev_close = Some(candle.close);
        scored.push((candle.clone(), outcome));
    }
    Ok(scored)
}

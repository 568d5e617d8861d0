//! Feature enrichment job.
//!
//! For every active (symbol, timeframe) pair: read the recent candle window,
//! run the feature engine, write the derived columns back, log the run.
//! Errors stay contained to the pair they hit.

use chrono::Utc;
use tracing::{info, warn};

use super::{JobContext, ENRICHMENT_WINDOW};
use crate::features;
use crate::models::Timeframe;
use crate::observability::new_trace_id;

pub async fn run_feature_enrichment(ctx: &JobContext) {
    let trace_id = new_trace_id();
    let started = Utc::now();
    info!(%trace_id, "feature enrichment run starting");

    let symbols = match ctx.db.list_active_symbols() {
        Ok(s) => s,
        Err(e) => {
            warn!(%trace_id, error = %e, "failed to load symbols for enrichment");
            return;
        }
    };

    let mut pairs = 0usize;
    let mut failures = 0usize;
    for record in &symbols {
        for timeframe in &record.timeframes {
            if ctx.stopped() {
                info!(%trace_id, "stop requested, enrichment cut short");
                break;
            }
            pairs += 1;
            if let Err(e) = enrich_pair(ctx, &record.symbol, *timeframe, &trace_id) {
                failures += 1;
                warn!(
                    %trace_id,
                    symbol = %record.symbol,
                    timeframe = timeframe.as_str(),
                    error = %e,
                    "enrichment failed for pair"
                );
            }
        }
    }

    let elapsed_ms = (Utc::now() - started).num_milliseconds() as f64;
    ctx.metrics
        .record("job:feature_enrichment", elapsed_ms, failures > 0);
    info!(%trace_id, pairs, failures, "feature enrichment run finished");
}

fn enrich_pair(
    ctx: &JobContext,
    symbol: &str,
    timeframe: Timeframe,
    trace_id: &str,
) -> anyhow::Result<()> {
    let stored = ctx.db.recent_candles(symbol, timeframe, ENRICHMENT_WINDOW)?;
    if stored.is_empty() {
        ctx.db
            .log_feature_run(symbol, timeframe, 0, 0, "skipped_no_data", None)?;
        return Ok(());
    }

    let candles: Vec<_> = stored.iter().map(|s| s.candle.clone()).collect();
    let rows = features::compute(&candles);

    let keyed: Vec<_> = candles
        .iter()
        .map(|c| c.time)
        .zip(rows.into_iter())
        .collect();

    match ctx.db.upsert_features(symbol, timeframe, &keyed, trace_id) {
        Ok(updated) => {
            ctx.db.log_feature_run(
                symbol,
                timeframe,
                candles.len(),
                updated,
                "completed",
                None,
            )?;
            Ok(())
        }
        Err(e) => {
            ctx.db.log_feature_run(
                symbol,
                timeframe,
                candles.len(),
                0,
                "failed",
                Some(&e.to_string()),
            )?;
            Err(e)
        }
    }
}

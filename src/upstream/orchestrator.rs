//! Multi-source fetch orchestration.
//!
//! Primary-only is the default path; the fallback is a resilience boundary,
//! not a load balancer. It is consulted when the primary is unavailable or
//! returns nothing, and optionally when the primary batch scores below the
//! quality threshold.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{MarketDataSource, UpstreamError};
use crate::models::{AssetClass, Candle, DataSource, Timeframe};
use crate::validation;

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub use_fallback: bool,
    pub validate: bool,
    pub threshold: f64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            use_fallback: true,
            validate: false,
            threshold: 0.85,
        }
    }
}

/// Outcome of one orchestrated fetch, for callers that need to distinguish a
/// legitimately empty window from an outage.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Data(Vec<Candle>, DataSource),
    /// Every reachable source answered, none had bars for the window.
    Empty,
    /// No source could be reached.
    Failed(String),
}

/// Snapshot of the orchestrator's tallies.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub primary_used: u64,
    pub fallback_used: u64,
    pub both_failed: u64,
    pub primary_better: u64,
    pub fallback_better: u64,
    pub equal: u64,
}

pub struct MultiSourceOrchestrator {
    primary: Arc<dyn MarketDataSource>,
    fallback: Option<Arc<dyn MarketDataSource>>,
    primary_used: AtomicU64,
    fallback_used: AtomicU64,
    both_failed: AtomicU64,
    primary_better: AtomicU64,
    fallback_better: AtomicU64,
    equal: AtomicU64,
}

impl MultiSourceOrchestrator {
    pub fn new(
        primary: Arc<dyn MarketDataSource>,
        fallback: Option<Arc<dyn MarketDataSource>>,
    ) -> Self {
        Self {
            primary,
            fallback,
            primary_used: AtomicU64::new(0),
            fallback_used: AtomicU64::new(0),
            both_failed: AtomicU64::new(0),
            primary_better: AtomicU64::new(0),
            fallback_better: AtomicU64::new(0),
            equal: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            primary_used: self.primary_used.load(Ordering::Relaxed),
            fallback_used: self.fallback_used.load(Ordering::Relaxed),
            both_failed: self.both_failed.load(Ordering::Relaxed),
            primary_better: self.primary_better.load(Ordering::Relaxed),
            fallback_better: self.fallback_better.load(Ordering::Relaxed),
            equal: self.equal.load(Ordering::Relaxed),
        }
    }

    /// Fetch a window, choosing the source per policy. An empty batch with
    /// `None` source means no source produced data.
    pub async fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        asset_class: AssetClass,
        opts: FetchOptions,
    ) -> (Vec<Candle>, Option<DataSource>) {
        match self
            .fetch_range_detailed(symbol, timeframe, start, end, asset_class, opts)
            .await
        {
            FetchOutcome::Data(candles, source) => (candles, Some(source)),
            FetchOutcome::Empty | FetchOutcome::Failed(_) => (Vec::new(), None),
        }
    }

    /// As `fetch_range`, but keeping "window is empty" and "sources are down"
    /// apart so backfill state can end up in the right terminal status.
    pub async fn fetch_range_detailed(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        asset_class: AssetClass,
        opts: FetchOptions,
    ) -> FetchOutcome {
        let primary_result = self
            .primary
            .fetch_range(symbol, timeframe, start, end, asset_class)
            .await;

        match primary_result {
            Ok(candles) if candles.is_empty() => {
                if opts.use_fallback && self.fallback.is_some() {
                    debug!(symbol, "primary returned empty window, trying fallback");
                    match self
                        .try_fallback(symbol, timeframe, start, end, asset_class)
                        .await
                    {
                        Some(outcome @ FetchOutcome::Data(..)) => outcome,
                        // Primary answered: the window is legitimately empty.
                        _ => FetchOutcome::Empty,
                    }
                } else {
                    FetchOutcome::Empty
                }
            }
            Ok(candles) => {
                if opts.validate {
                    let score = validation::batch_quality_score(&candles);
                    if score < opts.threshold && opts.use_fallback && self.fallback.is_some() {
                        return self
                            .compare_with_fallback(
                                symbol,
                                timeframe,
                                start,
                                end,
                                asset_class,
                                candles,
                                score,
                            )
                            .await;
                    }
                }
                self.primary_used.fetch_add(1, Ordering::Relaxed);
                FetchOutcome::Data(candles, DataSource::Primary)
            }
            Err(UpstreamError::Unavailable(reason)) if opts.use_fallback => {
                warn!(symbol, %reason, "primary unavailable, trying fallback");
                match self
                    .try_fallback(symbol, timeframe, start, end, asset_class)
                    .await
                {
                    Some(outcome @ FetchOutcome::Data(..)) => outcome,
                    Some(FetchOutcome::Empty) => FetchOutcome::Empty,
                    _ => {
                        self.both_failed.fetch_add(1, Ordering::Relaxed);
                        FetchOutcome::Failed(format!("primary unavailable ({reason}), fallback failed"))
                    }
                }
            }
            Err(e) => {
                warn!(symbol, error = %e, "primary fetch failed, fallback not applicable");
                self.both_failed.fetch_add(1, Ordering::Relaxed);
                FetchOutcome::Failed(e.to_string())
            }
        }
    }

    /// `None` when no fallback is configured; `Some(Failed)` when it errored.
    async fn try_fallback(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        asset_class: AssetClass,
    ) -> Option<FetchOutcome> {
        let fallback = self.fallback.as_ref()?;

        match fallback
            .fetch_range(symbol, timeframe, start, end, asset_class)
            .await
        {
            Ok(candles) if !candles.is_empty() => {
                self.fallback_used.fetch_add(1, Ordering::Relaxed);
                info!(symbol, bars = candles.len(), "served from fallback source");
                Some(FetchOutcome::Data(candles, DataSource::Fallback))
            }
            Ok(_) => Some(FetchOutcome::Empty),
            Err(e) => {
                warn!(symbol, error = %e, "fallback fetch failed");
                Some(FetchOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Primary data scored below threshold: fetch the fallback batch and keep
    /// whichever scores higher.
    #[allow(clippy::too_many_arguments)]
    async fn compare_with_fallback(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        asset_class: AssetClass,
        primary_candles: Vec<Candle>,
        primary_score: f64,
    ) -> FetchOutcome {
        let fallback_candles = match self
            .try_fallback(symbol, timeframe, start, end, asset_class)
            .await
        {
            Some(FetchOutcome::Data(c, _)) => c,
            // Low-quality primary data still beats nothing. The counter above
            // already recorded the fallback win attempt, back it out.
            _ => {
                self.primary_used.fetch_add(1, Ordering::Relaxed);
                return FetchOutcome::Data(primary_candles, DataSource::Primary);
            }
        };

        let fallback_score = validation::batch_quality_score(&fallback_candles);
        debug!(
            symbol,
            primary_score, fallback_score, "comparing source quality"
        );

        if fallback_score > primary_score {
            self.fallback_better.fetch_add(1, Ordering::Relaxed);
            FetchOutcome::Data(fallback_candles, DataSource::Fallback)
        } else {
            if (fallback_score - primary_score).abs() < f64::EPSILON {
                self.equal.fetch_add(1, Ordering::Relaxed);
            } else {
                self.primary_better.fetch_add(1, Ordering::Relaxed);
            }
            // The fallback fetch bumped its usage counter; the batch we keep
            // is the primary one.
            self.fallback_used.fetch_sub(1, Ordering::Relaxed);
            self.primary_used.fetch_add(1, Ordering::Relaxed);
            FetchOutcome::Data(primary_candles, DataSource::Primary)
        }
    }
}

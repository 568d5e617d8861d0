//! Per-candle integrity checks and quality scoring.
//!
//! The engine returns a `ValidationOutcome` value with the accumulated check
//! results and a computed score; it never errors and never panics. Hard
//! failures cost 0.40 each, soft flags 0.10. A candle is considered validated
//! once its score clears 0.85.

use serde::Serialize;

use crate::models::Candle;

/// Relative close-to-close move beyond which a candle is hard-failed (500%).
pub const EXTREME_MOVE_THRESHOLD: f64 = 5.0;
/// Open-vs-prev-close gap that soft-flags a candle (10%).
pub const GAP_THRESHOLD: f64 = 0.10;
/// Volume outside [median/10, median*10] soft-flags the candle.
pub const VOLUME_ANOMALY_FACTOR: f64 = 10.0;

const HARD_PENALTY: f64 = 0.40;
const SOFT_PENALTY: f64 = 0.10;
/// A candle at or above this score counts as validated.
pub const VALIDATION_THRESHOLD: f64 = 0.85;

/// Result of scoring one candle.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub quality_score: f64,
    pub validated: bool,
    pub gap_detected: bool,
    pub volume_anomaly: bool,
    /// Human-readable concatenation of every check outcome.
    pub notes: String,
    pub failed_checks: Vec<String>,
}

/// Score one candle against its series context. `prev_close` is `None` for
/// the first candle of a series, which skips the gap and price-move checks;
/// missing `median_volume` skips the volume check.
pub fn score_candle(
    candle: &Candle,
    prev_close: Option<f64>,
    median_volume: Option<f64>,
) -> ValidationOutcome {
    let mut score = 1.0_f64;
    let mut notes: Vec<String> = Vec::new();
    let mut failed: Vec<String> = Vec::new();
    let mut gap_detected = false;
    let mut volume_anomaly = false;

    // Hard check 1: OHLC structural constraints.
    let mut ohlc_violations: Vec<&str> = Vec::new();
    if candle.high < candle.open.max(candle.close) {
        ohlc_violations.push("high below body");
    }
    if candle.low > candle.open.min(candle.close) {
        ohlc_violations.push("low above body");
    }
    if candle.low > candle.high {
        ohlc_violations.push("low above high");
    }
    if candle.open < 0.0 || candle.high < 0.0 || candle.low < 0.0 || candle.close < 0.0 {
        ohlc_violations.push("negative price");
    }
    if candle.volume < 0.0 {
        ohlc_violations.push("negative volume");
    }
    if ohlc_violations.is_empty() {
        notes.push("ohlc ok".to_string());
    } else {
        score -= HARD_PENALTY;
        let detail = format!("ohlc failed ({})", ohlc_violations.join(", "));
        notes.push(detail.clone());
        failed.push(detail);
    }

    // Hard check 2: extreme close-to-close move.
    if let Some(prev) = prev_close.filter(|p| *p > 0.0) {
        let rel_move = ((candle.close - prev) / prev).abs();
        if rel_move > EXTREME_MOVE_THRESHOLD {
            score -= HARD_PENALTY;
            let detail = format!("extreme move {:.0}% vs prev close", rel_move * 100.0);
            notes.push(detail.clone());
            failed.push(detail);
        } else {
            notes.push("price move ok".to_string());
        }

        // Soft check 3: opening gap.
        let gap = ((candle.open - prev) / prev).abs();
        if gap > GAP_THRESHOLD {
            score -= SOFT_PENALTY;
            gap_detected = true;
            notes.push(format!("gap {:.1}% vs prev close", gap * 100.0));
        } else {
            notes.push("gap ok".to_string());
        }
    } else {
        notes.push("no prev close, move/gap checks skipped".to_string());
    }

    // Soft check 4: volume anomaly against the series median.
    if let Some(median) = median_volume.filter(|m| *m > 0.0) {
        if candle.volume > median * VOLUME_ANOMALY_FACTOR
            || candle.volume < median / VOLUME_ANOMALY_FACTOR
        {
            score -= SOFT_PENALTY;
            volume_anomaly = true;
            notes.push(format!(
                "volume anomaly ({:.0} vs median {:.0})",
                candle.volume, median
            ));
        } else {
            notes.push("volume ok".to_string());
        }
    } else {
        notes.push("no median volume, volume check skipped".to_string());
    }

    let score = score.clamp(0.0, 1.0);
    ValidationOutcome {
        quality_score: score,
        validated: score >= VALIDATION_THRESHOLD,
        gap_detected,
        volume_anomaly,
        notes: notes.join("; "),
        failed_checks: failed,
    }
}

/// Quick batch score for source comparison: mean per-candle score with the
/// previous candle's close as context and no volume baseline.
pub fn batch_quality_score(candles: &[Candle]) -> f64 {
    if candles.is_empty() {
        return 0.0;
    }
    let mut total = 0.0;
    let mut prev_close: Option<f64> = None;
    for candle in candles {
        total += score_candle(candle, prev_close, None).quality_score;
        prev_close = Some(candle.close);
    }
    total / candles.len() as f64
}

/// Median of a volume series; `None` on an empty slice.
pub fn median_volume(volumes: &[f64]) -> Option<f64> {
    if volumes.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = volumes.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

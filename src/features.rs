//! Quant feature derivation over an ordered OHLCV window.
//!
//! `compute` is a pure function: one (symbol, timeframe) series in, the same
//! rows annotated with derived columns out. Rows that do not yet have enough
//! history carry `None` for the affected columns. All divisions are guarded;
//! outputs stay finite.

use serde::{Deserialize, Serialize};

use crate::models::Candle;

const VOL_SHORT_WINDOW: usize = 20;
const VOL_LONG_WINDOW: usize = 50;
const ATR_PERIOD: usize = 14;
const VOLUME_WINDOW: usize = 20;
const STRUCTURE_LOOKBACK: usize = 5;
const BOLLINGER_WINDOW: usize = 20;
const COMPRESSION_HISTORY: usize = 50;
const COMPRESSION_MIN_HISTORY: usize = 20;
const COMPRESSION_PERCENTILE: f64 = 0.60;
const ANNUALISATION: f64 = 252.0;
/// EMA separation below this fraction of price reads as ranging.
const TREND_DEAD_ZONE: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Neutral,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Up => "up",
            TrendDirection::Down => "down",
            TrendDirection::Neutral => "neutral",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "up" => Some(TrendDirection::Up),
            "down" => Some(TrendDirection::Down),
            "neutral" => Some(TrendDirection::Neutral),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructureLabel {
    Bullish,
    Bearish,
    Range,
}

impl StructureLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StructureLabel::Bullish => "bullish",
            StructureLabel::Bearish => "bearish",
            StructureLabel::Range => "range",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bullish" => Some(StructureLabel::Bullish),
            "bearish" => Some(StructureLabel::Bearish),
            "range" => Some(StructureLabel::Range),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolatilityRegime {
    Low,
    Medium,
    High,
}

impl VolatilityRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolatilityRegime::Low => "low",
            VolatilityRegime::Medium => "medium",
            VolatilityRegime::High => "high",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(VolatilityRegime::Low),
            "medium" => Some(VolatilityRegime::Medium),
            "high" => Some(VolatilityRegime::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendRegime {
    Uptrend,
    Downtrend,
    Ranging,
}

impl TrendRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendRegime::Uptrend => "uptrend",
            TrendRegime::Downtrend => "downtrend",
            TrendRegime::Ranging => "ranging",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "uptrend" => Some(TrendRegime::Uptrend),
            "downtrend" => Some(TrendRegime::Downtrend),
            "ranging" => Some(TrendRegime::Ranging),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionRegime {
    Compressed,
    Expanded,
}

impl CompressionRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionRegime::Compressed => "compressed",
            CompressionRegime::Expanded => "expanded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "compressed" => Some(CompressionRegime::Compressed),
            "expanded" => Some(CompressionRegime::Expanded),
            _ => None,
        }
    }
}

/// Derived columns for one candle. Order matches the input series.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureRow {
    pub log_return: Option<f64>,
    pub return_1d: Option<f64>,
    pub return_1h: Option<f64>,
    pub volatility_20: Option<f64>,
    pub volatility_50: Option<f64>,
    pub atr_14: Option<f64>,
    pub rolling_volume_20: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub hh: Option<bool>,
    pub hl: Option<bool>,
    pub lh: Option<bool>,
    pub ll: Option<bool>,
    pub trend_direction: Option<TrendDirection>,
    pub structure_label: Option<StructureLabel>,
    pub volatility_regime: Option<VolatilityRegime>,
    pub trend_regime: Option<TrendRegime>,
    pub compression_regime: Option<CompressionRegime>,
}

/// Annotate an ascending candle series with derived features. Windows of 50+
/// candles give full coverage; shorter inputs simply leave the longer-window
/// columns null.
pub fn compute(candles: &[Candle]) -> Vec<FeatureRow> {
    let n = candles.len();
    let mut rows: Vec<FeatureRow> = vec![FeatureRow::default(); n];
    if n == 0 {
        return rows;
    }

    // Returns.
    let mut return_1d: Vec<Option<f64>> = vec![None; n];
    for (i, candle) in candles.iter().enumerate() {
        rows[i].log_return = safe_log_ratio(candle.close, candle.open);
        if i >= 1 {
            return_1d[i] = safe_log_ratio(candle.close, candles[i - 1].close);
        }
        rows[i].return_1d = return_1d[i];
        // Period proxy: the prior bar's one-bar return.
        if i >= 1 {
            rows[i].return_1h = return_1d[i - 1];
        }
    }

    // Rolling volatility of the one-bar return, annualised.
    let vol_short = rolling_std(&return_1d, VOL_SHORT_WINDOW);
    let vol_long = rolling_std(&return_1d, VOL_LONG_WINDOW);
    for i in 0..n {
        rows[i].volatility_20 = vol_short[i].map(|v| v * ANNUALISATION.sqrt());
        rows[i].volatility_50 = vol_long[i].map(|v| v * ANNUALISATION.sqrt());
    }

    // ATR: EMA of the true range.
    let atr = average_true_range(candles, ATR_PERIOD);
    for i in 0..n {
        rows[i].atr_14 = atr[i];
    }

    // Volume baseline and ratio.
    let volumes: Vec<Option<f64>> = candles.iter().map(|c| Some(c.volume)).collect();
    let vol_mean = rolling_mean(&volumes, VOLUME_WINDOW);
    for i in 0..n {
        rows[i].rolling_volume_20 = vol_mean[i];
        rows[i].volume_ratio = match vol_mean[i] {
            Some(mean) if mean > 0.0 => Some(candles[i].volume / mean),
            _ => None,
        };
    }

    // Market structure over the trailing lookback (previous bars only).
    for i in 0..n {
        if i + 1 < STRUCTURE_LOOKBACK {
            continue;
        }
        let window = &candles[i + 1 - STRUCTURE_LOOKBACK..i];
        let prev_high_max = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let prev_high_min = window.iter().map(|c| c.high).fold(f64::MAX, f64::min);
        let prev_low_max = window.iter().map(|c| c.low).fold(f64::MIN, f64::max);
        let prev_low_min = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);

        let hh = candles[i].high > prev_high_max;
        let hl = candles[i].low > prev_low_max;
        let lh = candles[i].high < prev_high_min;
        let ll = candles[i].low < prev_low_min;
        rows[i].hh = Some(hh);
        rows[i].hl = Some(hl);
        rows[i].lh = Some(lh);
        rows[i].ll = Some(ll);

        let base = candles[i + 1 - STRUCTURE_LOOKBACK].close;
        rows[i].trend_direction = Some(if base <= 0.0 {
            TrendDirection::Neutral
        } else {
            let ret = candles[i].close / base - 1.0;
            if ret > 0.0 {
                TrendDirection::Up
            } else if ret < 0.0 {
                TrendDirection::Down
            } else {
                TrendDirection::Neutral
            }
        });

        rows[i].structure_label = Some(if hh && hl {
            StructureLabel::Bullish
        } else if lh && ll {
            StructureLabel::Bearish
        } else {
            StructureLabel::Range
        });
    }

    // Volatility regime: tertiles of the long volatility over this window.
    let observed: Vec<f64> = rows.iter().filter_map(|r| r.volatility_50).collect();
    if observed.len() >= 3 {
        let lower = percentile(&observed, 1.0 / 3.0);
        let upper = percentile(&observed, 2.0 / 3.0);
        for row in rows.iter_mut() {
            row.volatility_regime = row.volatility_50.map(|v| {
                if v <= lower {
                    VolatilityRegime::Low
                } else if v <= upper {
                    VolatilityRegime::Medium
                } else {
                    VolatilityRegime::High
                }
            });
        }
    }

    // Trend regime: EMA20 vs EMA50 with a dead zone around parity.
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let ema20 = ema(&closes, VOL_SHORT_WINDOW);
    let ema50 = ema(&closes, VOL_LONG_WINDOW);
    for i in 0..n {
        if let (Some(fast), Some(slow)) = (ema20[i], ema50[i]) {
            let dead_zone = TREND_DEAD_ZONE * candles[i].close.abs();
            rows[i].trend_regime = Some(if (fast - slow).abs() <= dead_zone {
                TrendRegime::Ranging
            } else if fast > slow {
                TrendRegime::Uptrend
            } else {
                TrendRegime::Downtrend
            });
        }
    }

    // Compression regime: Bollinger width vs the 60th percentile of its own
    // trailing history.
    let widths = bollinger_width(&closes, BOLLINGER_WINDOW);
    for i in 0..n {
        let Some(width) = widths[i] else { continue };
        let history: Vec<f64> = widths[..=i]
            .iter()
            .rev()
            .filter_map(|w| *w)
            .take(COMPRESSION_HISTORY)
            .collect();
        if history.len() < COMPRESSION_MIN_HISTORY {
            continue;
        }
        let threshold = percentile(&history, COMPRESSION_PERCENTILE);
        rows[i].compression_regime = Some(if width < threshold {
            CompressionRegime::Compressed
        } else {
            CompressionRegime::Expanded
        });
    }

    rows
}

fn safe_log_ratio(numer: f64, denom: f64) -> Option<f64> {
    if numer > 0.0 && denom > 0.0 {
        let v = (numer / denom).ln();
        v.is_finite().then_some(v)
    } else {
        None
    }
}

/// Rolling sample standard deviation over `window` observations; `None` until
/// the window is full of present values.
fn rolling_std(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let n = values.len();
    let mut out = vec![None; n];
    for i in 0..n {
        if i + 1 < window {
            continue;
        }
        let slice: Vec<f64> = values[i + 1 - window..=i].iter().filter_map(|v| *v).collect();
        if slice.len() < window {
            continue;
        }
        let mean = slice.iter().sum::<f64>() / slice.len() as f64;
        let var = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (slice.len() - 1) as f64;
        let sd = var.sqrt();
        if sd.is_finite() {
            out[i] = Some(sd);
        }
    }
    out
}

fn rolling_mean(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let n = values.len();
    let mut out = vec![None; n];
    for i in 0..n {
        if i + 1 < window {
            continue;
        }
        let slice: Vec<f64> = values[i + 1 - window..=i].iter().filter_map(|v| *v).collect();
        if slice.len() < window {
            continue;
        }
        out[i] = Some(slice.iter().sum::<f64>() / slice.len() as f64);
    }
    out
}

/// EMA with standard smoothing (alpha = 2/(n+1)), seeded by the SMA of the
/// first `period` values.
fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let n = values.len();
    let mut out = vec![None; n];
    if n < period || period == 0 {
        return out;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(seed);
    let mut prev = seed;
    for i in period..n {
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        out[i] = Some(prev);
    }
    out
}

/// True range per bar, then an EMA over it.
fn average_true_range(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let n = candles.len();
    if n == 0 {
        return Vec::new();
    }
    let mut tr = Vec::with_capacity(n);
    tr.push(candles[0].high - candles[0].low);
    for i in 1..n {
        let prev_close = candles[i - 1].close;
        let range = (candles[i].high - candles[i].low)
            .max((candles[i].high - prev_close).abs())
            .max((candles[i].low - prev_close).abs());
        tr.push(range);
    }
    ema(&tr, period)
}

/// Bollinger band width: 4 sigma (upper minus lower at 2 standard
/// deviations), normalised by the moving average when it is nonzero.
fn bollinger_width(closes: &[f64], window: usize) -> Vec<Option<f64>> {
    let values: Vec<Option<f64>> = closes.iter().map(|c| Some(*c)).collect();
    let means = rolling_mean(&values, window);
    let stds = rolling_std(&values, window);
    means
        .iter()
        .zip(stds.iter())
        .map(|(m, s)| match (m, s) {
            (Some(mean), Some(sd)) if mean.abs() > f64::EPSILON => Some(4.0 * sd / mean.abs()),
            (Some(_), Some(sd)) => Some(4.0 * sd),
            _ => None,
        })
        .collect()
}

/// Linear-interpolated percentile over an unsorted sample, `q` in [0, 1].
fn percentile(sample: &[f64], q: f64) -> f64 {
    let mut sorted: Vec<f64> = sample.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = pos - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn series(closes: &[f64]) -> Vec<Candle> {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                time: t0 + Duration::days(i as i64),
                open: close * 0.99,
                high: close * 1.01,
                low: close * 0.98,
                close,
                volume: 1_000.0 + i as f64,
            })
            .collect()
    }

    fn trending_series(n: usize) -> Vec<Candle> {
        series(&(0..n).map(|i| 100.0 + i as f64).collect::<Vec<_>>())
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert!(compute(&[]).is_empty());
    }

    #[test]
    fn first_row_has_no_cross_bar_returns() {
        let rows = compute(&trending_series(3));
        assert!(rows[0].return_1d.is_none());
        assert!(rows[0].log_return.is_some());
        assert!(rows[1].return_1d.is_some());
        assert!(rows[2].return_1h.is_some());
        // return_1h lags return_1d by one bar.
        assert_eq!(rows[2].return_1h, rows[1].return_1d);
    }

    #[test]
    fn log_return_matches_closed_form() {
        let candles = series(&[100.0, 110.0]);
        let rows = compute(&candles);
        let expected = (110.0_f64 / 100.0).ln();
        assert!((rows[1].return_1d.unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn volatility_needs_full_window() {
        let rows = compute(&trending_series(60));
        // return_1d starts at index 1; a 20-wide window is first full at index 20.
        assert!(rows[19].volatility_20.is_none());
        assert!(rows[20].volatility_20.is_some());
        assert!(rows[49].volatility_50.is_none());
        assert!(rows[50].volatility_50.is_some());
    }

    #[test]
    fn constant_series_has_zero_volatility() {
        let rows = compute(&series(&[100.0; 60]));
        assert!(rows[59].volatility_20.unwrap().abs() < 1e-12);
    }

    #[test]
    fn atr_positive_on_real_ranges() {
        let rows = compute(&trending_series(30));
        let atr = rows[20].atr_14.unwrap();
        assert!(atr > 0.0);
        assert!(atr.is_finite());
    }

    #[test]
    fn volume_ratio_near_one_for_flat_volume() {
        let mut candles = trending_series(30);
        for c in &mut candles {
            c.volume = 5_000.0;
        }
        let rows = compute(&candles);
        assert!((rows[25].volume_ratio.unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(rows[25].rolling_volume_20.unwrap(), 5_000.0);
    }

    #[test]
    fn monotone_rise_reads_bullish() {
        let rows = compute(&trending_series(10));
        let last = &rows[9];
        assert_eq!(last.hh, Some(true));
        assert_eq!(last.hl, Some(true));
        assert_eq!(last.trend_direction, Some(TrendDirection::Up));
        assert_eq!(last.structure_label, Some(StructureLabel::Bullish));
    }

    #[test]
    fn monotone_fall_reads_bearish() {
        let closes: Vec<f64> = (0..10).map(|i| 200.0 - 5.0 * i as f64).collect();
        let rows = compute(&series(&closes));
        let last = &rows[9];
        assert_eq!(last.lh, Some(true));
        assert_eq!(last.ll, Some(true));
        assert_eq!(last.trend_direction, Some(TrendDirection::Down));
        assert_eq!(last.structure_label, Some(StructureLabel::Bearish));
    }

    #[test]
    fn structure_needs_lookback() {
        let rows = compute(&trending_series(10));
        assert!(rows[3].structure_label.is_none());
        assert!(rows[4].structure_label.is_some());
    }

    #[test]
    fn uptrend_regime_on_long_rise() {
        let rows = compute(&trending_series(120));
        assert_eq!(rows[119].trend_regime, Some(TrendRegime::Uptrend));
    }

    #[test]
    fn flat_series_ranges() {
        let rows = compute(&series(&[100.0; 120]));
        assert_eq!(rows[119].trend_regime, Some(TrendRegime::Ranging));
    }

    #[test]
    fn compression_appears_with_enough_history() {
        let rows = compute(&trending_series(120));
        assert!(rows[119].compression_regime.is_some());
        // Too early: no width history yet.
        assert!(rows[20].compression_regime.is_none());
    }

    #[test]
    fn volatility_regime_partitions_window() {
        // Calm first half, violent second half.
        let mut closes: Vec<f64> = (0..60).map(|i| 100.0 + 0.01 * i as f64).collect();
        let mut level = closes[59];
        for i in 0..60 {
            level += if i % 2 == 0 { 8.0 } else { -7.0 };
            closes.push(level);
        }
        let rows = compute(&series(&closes));
        let regimes: Vec<_> = rows.iter().filter_map(|r| r.volatility_regime).collect();
        assert!(regimes.contains(&VolatilityRegime::Low));
        assert!(regimes.contains(&VolatilityRegime::High));
    }

    #[test]
    fn recompute_is_deterministic() {
        let candles = trending_series(80);
        let a = compute(&candles);
        let b = compute(&candles);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.volatility_20, y.volatility_20);
            assert_eq!(x.atr_14, y.atr_14);
            assert_eq!(x.compression_regime, y.compression_regime);
        }
    }

    #[test]
    fn zero_prices_do_not_poison_output() {
        let mut candles = trending_series(30);
        candles[5].open = 0.0;
        candles[5].close = 0.0;
        let rows = compute(&candles);
        assert!(rows[5].log_return.is_none());
        assert!(rows[6].return_1d.is_none());
        for row in &rows {
            for v in [row.volatility_20, row.atr_14, row.volume_ratio] {
                if let Some(v) = v {
                    assert!(v.is_finite());
                }
            }
        }
    }

    #[test]
    fn percentile_interpolates() {
        let sample = [1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&sample, 0.5) - 2.5).abs() < 1e-12);
        assert_eq!(percentile(&sample, 0.0), 1.0);
        assert_eq!(percentile(&sample, 1.0), 4.0);
    }
}

//! Primary (paid) market-data provider client.
//!
//! Speaks the provider's aggregate-bars API: one request per
//! (symbol, timeframe, window), bearer-token auth, millisecond epoch
//! timestamps. Transient failures retry with exponential backoff and jitter;
//! permanent rejections surface immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{MarketDataSource, RateLimiter, UpstreamError};
use crate::models::{AssetClass, Candle, DataSource, Dividend, Split, Timeframe};

const DEFAULT_BASE_URL: &str = "https://api.polygon.io";
const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF_SECS: f64 = 1.0;
const BACKOFF_JITTER: f64 = 0.20;
const CUMULATIVE_BACKOFF_CAP_SECS: f64 = 300.0;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const PAGE_LIMIT: u32 = 50_000;

/// Provider (multiplier, timespan) pair for a timeframe. The map is fixed.
pub fn provider_range(tf: Timeframe) -> (u32, &'static str) {
    match tf {
        Timeframe::M1 => (1, "minute"),
        Timeframe::M5 => (5, "minute"),
        Timeframe::M15 => (15, "minute"),
        Timeframe::M30 => (30, "minute"),
        Timeframe::H1 => (1, "hour"),
        Timeframe::H2 => (2, "hour"),
        Timeframe::H4 => (4, "hour"),
        Timeframe::D1 => (1, "day"),
        Timeframe::W1 => (1, "week"),
    }
}

#[derive(Debug, Deserialize)]
struct AggregatesResponse {
    #[serde(default)]
    results: Vec<AggregateBar>,
    #[serde(default)]
    #[allow(dead_code)]
    status: Option<String>,
}

/// One provider bar. Unrecognised fields are rejected rather than silently
/// ignored so payload drift is caught at the decode boundary.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AggregateBar {
    /// Bucket start, epoch milliseconds.
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    /// Volume-weighted average price; present but unused.
    #[serde(default)]
    #[allow(dead_code)]
    vw: Option<f64>,
    /// Trade count; present but unused.
    #[serde(default)]
    #[allow(dead_code)]
    n: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DividendsResponse {
    #[serde(default)]
    results: Vec<DividendRow>,
}

#[derive(Debug, Deserialize)]
struct DividendRow {
    ex_dividend_date: chrono::NaiveDate,
    cash_amount: f64,
    #[serde(default)]
    frequency: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SplitsResponse {
    #[serde(default)]
    results: Vec<SplitRow>,
}

#[derive(Debug, Deserialize)]
struct SplitRow {
    execution_date: chrono::NaiveDate,
    split_from: f64,
    split_to: f64,
}

pub struct PrimaryClient {
    client: Client,
    base_url: String,
    api_key: String,
    rate_limiter: Arc<RateLimiter>,
    total_requests: AtomicU64,
    rate_limited_count: AtomicU64,
}

impl PrimaryClient {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        rate_limiter: Arc<RateLimiter>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent("mdwarehouse/0.1 (ingestion)")
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            rate_limiter,
            total_requests: AtomicU64::new(0),
            rate_limited_count: AtomicU64::new(0),
        })
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn rate_limited_count(&self) -> u64 {
        self.rate_limited_count.load(Ordering::Relaxed)
    }

    /// Dividends with ex-date inside [start, end].
    pub async fn fetch_dividends(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Dividend>, UpstreamError> {
        let url = format!("{}/v3/reference/dividends", self.base_url);
        let query = [
            ("ticker", symbol.to_string()),
            ("ex_dividend_date.gte", start.date_naive().to_string()),
            ("ex_dividend_date.lte", end.date_naive().to_string()),
        ];
        let body = self.execute_with_retry(&url, &query).await?;
        let parsed: DividendsResponse = serde_json::from_str(&body)
            .map_err(|e| UpstreamError::Malformed(format!("dividends decode: {e}")))?;

        Ok(parsed
            .results
            .into_iter()
            .map(|d| Dividend {
                symbol: symbol.to_string(),
                ex_date: d.ex_dividend_date,
                cash_amount: d.cash_amount,
                frequency: d.frequency,
            })
            .collect())
    }

    /// Splits executed inside [start, end].
    pub async fn fetch_splits(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Split>, UpstreamError> {
        let url = format!("{}/v3/reference/splits", self.base_url);
        let query = [
            ("ticker", symbol.to_string()),
            ("execution_date.gte", start.date_naive().to_string()),
            ("execution_date.lte", end.date_naive().to_string()),
        ];
        let body = self.execute_with_retry(&url, &query).await?;
        let parsed: SplitsResponse = serde_json::from_str(&body)
            .map_err(|e| UpstreamError::Malformed(format!("splits decode: {e}")))?;

        Ok(parsed
            .results
            .into_iter()
            .map(|s| Split {
                symbol: symbol.to_string(),
                execution_date: s.execution_date,
                split_from: s.split_from,
                split_to: s.split_to,
            })
            .collect())
    }

    /// Issue a GET with retry on transient failures. Returns the response
    /// body on 2xx. 429 and 5xx back off and retry; other 4xx rejects
    /// immediately.
    async fn execute_with_retry(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<String, UpstreamError> {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        let mut slept_secs = 0.0_f64;
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            self.rate_limiter.acquire().await;
            self.total_requests.fetch_add(1, Ordering::Relaxed);

            let request = self
                .client
                .get(url)
                .bearer_auth(&self.api_key)
                .query(query);

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .text()
                            .await
                            .map_err(|e| UpstreamError::Malformed(format!("body read: {e}")));
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        self.rate_limited_count.fetch_add(1, Ordering::Relaxed);
                        warn!(url, attempt, "primary rate limited (429), backing off");
                        last_error = "429 Too Many Requests".to_string();
                    } else if status.is_server_error() {
                        warn!(url, attempt, status = %status, "primary server error, backing off");
                        last_error = format!("server error {status}");
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        return Err(UpstreamError::Rejected {
                            status: status.as_u16(),
                            body,
                        });
                    }
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "primary request failed");
                    last_error = e.to_string();
                }
            }

            if attempt < MAX_ATTEMPTS {
                let delay = jittered(backoff_secs);
                if slept_secs + delay > CUMULATIVE_BACKOFF_CAP_SECS {
                    break;
                }
                debug!(url, "retrying in {:.1}s", delay);
                sleep(Duration::from_secs_f64(delay)).await;
                slept_secs += delay;
                backoff_secs *= 2.0;
            }
        }

        Err(UpstreamError::Unavailable(format!(
            "{url}: retries exhausted ({last_error})"
        )))
    }
}

/// Apply ±20% uniform jitter to a backoff delay.
fn jittered(base_secs: f64) -> f64 {
    let factor = rand::thread_rng().gen_range(1.0 - BACKOFF_JITTER..=1.0 + BACKOFF_JITTER);
    base_secs * factor
}

/// Decode a provider aggregates payload into ascending normalised candles.
/// Millisecond timestamps become UTC bucket starts.
fn parse_aggregates(body: &str) -> Result<Vec<Candle>, UpstreamError> {
    let parsed: AggregatesResponse = serde_json::from_str(body)
        .map_err(|e| UpstreamError::Malformed(format!("aggregates decode: {e}")))?;

    let mut candles: Vec<Candle> = parsed
        .results
        .into_iter()
        .map(|bar| {
            let secs = bar.t.div_euclid(1000);
            let time = Utc
                .timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| UpstreamError::Malformed(format!("bad timestamp {}", bar.t)))?;
            Ok(Candle {
                time,
                open: bar.o,
                high: bar.h,
                low: bar.l,
                close: bar.c,
                volume: bar.v,
            })
        })
        .collect::<Result<_, UpstreamError>>()?;

    candles.sort_by_key(|c| c.time);
    Ok(candles)
}

#[async_trait]
impl MarketDataSource for PrimaryClient {
    fn source(&self) -> DataSource {
        DataSource::Primary
    }

    async fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        asset_class: AssetClass,
    ) -> Result<Vec<Candle>, UpstreamError> {
        let (multiplier, span) = provider_range(timeframe);
        // Crypto tickers carry an exchange prefix on this provider.
        let ticker = match asset_class {
            AssetClass::Crypto => format!("X:{symbol}USD"),
            AssetClass::Stock | AssetClass::Etf => symbol.to_string(),
        };

        let url = format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.base_url,
            ticker,
            multiplier,
            span,
            start.timestamp_millis(),
            end.timestamp_millis(),
        );
        let query = [
            ("adjusted", "true".to_string()),
            ("sort", "asc".to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];

        let body = self.execute_with_retry(&url, &query).await?;
        let candles = parse_aggregates(&body)?;
        debug!(
            symbol,
            timeframe = timeframe.as_str(),
            bars = candles.len(),
            "primary fetch complete"
        );
        Ok(candles)
    }
}

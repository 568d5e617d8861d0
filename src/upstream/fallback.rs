//! Fallback (free) market-data provider client.
//!
//! Same fetch contract as the primary, backed by a chart-style API with
//! column-oriented payloads and second-resolution timestamps. Coverage is
//! broad (equities, ETFs, crypto) but throughput is low, so this client gets
//! its own slower rate limiter. Timestamps are bucket-start UTC, matching the
//! primary's convention.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{MarketDataSource, RateLimiter, UpstreamError};
use crate::models::{AssetClass, Candle, DataSource, Timeframe};

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_SECS: f64 = 2.0;
const REQUEST_TIMEOUT_SECS: u64 = 30;

fn interval_code(tf: Timeframe) -> &'static str {
    match tf {
        Timeframe::M1 => "1m",
        Timeframe::M5 => "5m",
        Timeframe::M15 => "15m",
        Timeframe::M30 => "30m",
        Timeframe::H1 => "60m",
        Timeframe::H2 => "120m",
        Timeframe::H4 => "240m",
        Timeframe::D1 => "1d",
        Timeframe::W1 => "1wk",
    }
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    #[serde(default)]
    result: Vec<ChartResult>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    quote: Vec<ChartQuote>,
}

/// Column-oriented OHLCV arrays. Individual entries may be null when the
/// provider has no trade in a bucket.
#[derive(Debug, Deserialize)]
struct ChartQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

pub struct FallbackClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
}

impl FallbackClient {
    pub fn new(base_url: Option<String>, rate_limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent("mdwarehouse/0.1 (fallback ingestion)")
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            rate_limiter,
        })
    }

    async fn execute_with_retry(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<String, UpstreamError> {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            self.rate_limiter.acquire().await;

            match self.client.get(url).query(query).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .text()
                            .await
                            .map_err(|e| UpstreamError::Malformed(format!("body read: {e}")));
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        warn!(url, attempt, status = %status, "fallback transient error");
                        last_error = format!("status {status}");
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        return Err(UpstreamError::Rejected {
                            status: status.as_u16(),
                            body,
                        });
                    }
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "fallback request failed");
                    last_error = e.to_string();
                }
            }

            if attempt < MAX_ATTEMPTS {
                sleep(Duration::from_secs_f64(backoff_secs)).await;
                backoff_secs *= 2.0;
            }
        }

        Err(UpstreamError::Unavailable(format!(
            "{url}: retries exhausted ({last_error})"
        )))
    }
}

/// Decode a chart payload into ascending candles. Buckets with null columns
/// are dropped.
fn parse_chart(body: &str) -> Result<Vec<Candle>, UpstreamError> {
    let envelope: ChartEnvelope = serde_json::from_str(body)
        .map_err(|e| UpstreamError::Malformed(format!("chart decode: {e}")))?;

    if let Some(err) = envelope.chart.error {
        if !err.is_null() {
            return Err(UpstreamError::Malformed(format!("chart error: {err}")));
        }
    }

    let Some(result) = envelope.chart.result.into_iter().next() else {
        return Ok(Vec::new());
    };
    let Some(quote) = result.indicators.quote.into_iter().next() else {
        return Ok(Vec::new());
    };

    let mut candles = Vec::with_capacity(result.timestamp.len());
    for (i, &ts) in result.timestamp.iter().enumerate() {
        let (open, high, low, close) = match (
            quote.open.get(i).copied().flatten(),
            quote.high.get(i).copied().flatten(),
            quote.low.get(i).copied().flatten(),
            quote.close.get(i).copied().flatten(),
        ) {
            (Some(o), Some(h), Some(l), Some(c)) => (o, h, l, c),
            _ => continue,
        };
        let volume = quote.volume.get(i).copied().flatten().unwrap_or(0.0);
        let time = Utc
            .timestamp_opt(ts, 0)
            .single()
            .ok_or_else(|| UpstreamError::Malformed(format!("bad timestamp {ts}")))?;

        candles.push(Candle {
            time,
            open,
            high,
            low,
            close,
            volume,
        });
    }

    candles.sort_by_key(|c| c.time);
    Ok(candles)
}

#[async_trait]
impl MarketDataSource for FallbackClient {
    fn source(&self) -> DataSource {
        DataSource::Fallback
    }

    async fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        asset_class: AssetClass,
    ) -> Result<Vec<Candle>, UpstreamError> {
        let ticker = match asset_class {
            AssetClass::Crypto => format!("{symbol}-USD"),
            AssetClass::Stock | AssetClass::Etf => symbol.to_string(),
        };
        let url = format!("{}/v8/finance/chart/{}", self.base_url, ticker);
        let query = [
            ("interval", interval_code(timeframe).to_string()),
            ("period1", start.timestamp().to_string()),
            ("period2", end.timestamp().to_string()),
        ];

        let body = self.execute_with_retry(&url, &query).await?;
        let candles = parse_chart(&body)?;
        debug!(
            symbol,
            timeframe = timeframe.as_str(),
            bars = candles.len(),
            "fallback fetch complete"
        );
        Ok(candles)
    }
}

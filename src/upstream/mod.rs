//! Upstream market-data providers.
//!
//! Two concrete clients share one fetch contract: the paid primary provider
//! and a free fallback with broader coverage but lower throughput. The
//! orchestrator picks between them per request.

pub mod fallback;
pub mod orchestrator;
pub mod primary;
pub mod rate_limiter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{AssetClass, Candle, DataSource, Timeframe};

pub use fallback::FallbackClient;
pub use orchestrator::{FetchOptions, MultiSourceOrchestrator, OrchestratorStats};
pub use primary::PrimaryClient;
pub use rate_limiter::RateLimiter;

/// Failure modes of an upstream fetch.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Transient failures (timeouts, 429, 5xx) that survived every retry.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// Permanent rejection; never retried.
    #[error("upstream rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Response arrived but could not be decoded.
    #[error("upstream response malformed: {0}")]
    Malformed(String),
}

/// The fetch contract shared by both providers (and faked in tests).
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    fn source(&self) -> DataSource;

    /// Fetch normalised candles in ascending time order. `time` on every
    /// returned candle is the UTC bucket start.
    async fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        asset_class: AssetClass,
    ) -> Result<Vec<Candle>, UpstreamError>;
}

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Candle bucket widths accepted by the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 9] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    pub fn from_str(s: &str) -> Option<Timeframe> {
        match s {
            "1m" => Some(Timeframe::M1),
            "5m" => Some(Timeframe::M5),
            "15m" => Some(Timeframe::M15),
            "30m" => Some(Timeframe::M30),
            "1h" => Some(Timeframe::H1),
            "2h" => Some(Timeframe::H2),
            "4h" => Some(Timeframe::H4),
            "1d" => Some(Timeframe::D1),
            "1w" => Some(Timeframe::W1),
            _ => None,
        }
    }

    /// Bucket width in seconds.
    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H2 => 7_200,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
            Timeframe::W1 => 604_800,
        }
    }

    /// Staleness threshold for the health monitor. Intraday series go stale
    /// within the hour, hourly within six, daily and weekly within a day.
    pub fn staleness_threshold(&self) -> chrono::Duration {
        match self {
            Timeframe::M1 | Timeframe::M5 | Timeframe::M15 | Timeframe::M30 => {
                chrono::Duration::hours(1)
            }
            Timeframe::H1 | Timeframe::H2 | Timeframe::H4 => chrono::Duration::hours(6),
            Timeframe::D1 | Timeframe::W1 => chrono::Duration::hours(24),
        }
    }
}

/// Asset classes the registry tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Stock,
    Etf,
    Crypto,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Stock => "stock",
            AssetClass::Etf => "etf",
            AssetClass::Crypto => "crypto",
        }
    }

    pub fn from_str(s: &str) -> Option<AssetClass> {
        match s {
            "stock" => Some(AssetClass::Stock),
            "etf" => Some(AssetClass::Etf),
            "crypto" => Some(AssetClass::Crypto),
            _ => None,
        }
    }
}

/// Which upstream produced a candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Primary,
    Fallback,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Primary => "primary",
            DataSource::Fallback => "fallback",
        }
    }

    pub fn from_str(s: &str) -> Option<DataSource> {
        match s {
            "primary" => Some(DataSource::Primary),
            "fallback" => Some(DataSource::Fallback),
            _ => None,
        }
    }
}

/// A normalised OHLCV bar. `time` is the UTC bucket start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Candle as stored, with validation metadata attached by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCandle {
    pub symbol: String,
    pub timeframe: Timeframe,
    #[serde(flatten)]
    pub candle: Candle,
    pub source: DataSource,
    pub validated: bool,
    pub quality_score: f64,
    pub validation_notes: String,
    pub gap_detected: bool,
    pub volume_anomaly: bool,
    pub fetched_at: DateTime<Utc>,
}

/// A tracked symbol from the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub active: bool,
    pub timeframes: Vec<Timeframe>,
    pub last_backfill: Option<DateTime<Utc>>,
    pub backfill_status: Option<String>,
}

/// Backfill execution lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillStatus::Pending => "pending",
            BackfillStatus::InProgress => "in_progress",
            BackfillStatus::Completed => "completed",
            BackfillStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<BackfillStatus> {
        match s {
            "pending" => Some(BackfillStatus::Pending),
            "in_progress" => Some(BackfillStatus::InProgress),
            "completed" => Some(BackfillStatus::Completed),
            "failed" => Some(BackfillStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BackfillStatus::Completed | BackfillStatus::Failed)
    }
}

/// One backfill attempt for a (symbol, timeframe) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillState {
    pub execution_id: Uuid,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub status: BackfillStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_inserted: i64,
    pub error_message: Option<String>,
    pub retry_count: i64,
}

/// Anomaly classes recorded by the monitor and the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Gap,
    Duplicate,
    Outlier,
    Stale,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::Gap => "gap",
            AnomalyType::Duplicate => "duplicate",
            AnomalyType::Outlier => "outlier",
            AnomalyType::Stale => "stale",
        }
    }

    pub fn from_str(s: &str) -> Option<AnomalyType> {
        match s {
            "gap" => Some(AnomalyType::Gap),
            "duplicate" => Some(AnomalyType::Duplicate),
            "outlier" => Some(AnomalyType::Outlier),
            "stale" => Some(AnomalyType::Stale),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalySeverity::Low => "low",
            AnomalySeverity::Medium => "medium",
            AnomalySeverity::High => "high",
            AnomalySeverity::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<AnomalySeverity> {
        match s {
            "low" => Some(AnomalySeverity::Low),
            "medium" => Some(AnomalySeverity::Medium),
            "high" => Some(AnomalySeverity::High),
            "critical" => Some(AnomalySeverity::Critical),
            _ => None,
        }
    }
}

/// An anomaly row from the append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataAnomaly {
    pub id: i64,
    pub symbol: String,
    pub timeframe: Option<Timeframe>,
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    pub description: String,
    pub affected_rows: i64,
    pub resolution_status: String,
    pub detected_at: DateTime<Utc>,
}

/// Corporate dividend event from the primary provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dividend {
    pub symbol: String,
    pub ex_date: NaiveDate,
    pub cash_amount: f64,
    pub frequency: Option<u32>,
}

/// Corporate split event from the primary provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Split {
    pub symbol: String,
    pub execution_date: NaiveDate,
    pub split_from: f64,
    pub split_to: f64,
}

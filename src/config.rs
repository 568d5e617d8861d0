//! Process configuration, sourced entirely from the environment.

use anyhow::{bail, Context, Result};
use std::env;

use crate::models::Timeframe;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_api_key: String,
    pub database_url: String,
    pub api_host: String,
    pub api_port: u16,
    pub api_workers: usize,
    pub log_level: String,
    pub backfill_schedule_minute: u32,
    pub backfill_schedule_hour: u32,
    pub max_concurrent_symbols: usize,
    pub parallel_backfill: bool,
    pub query_cache_max_size: usize,
    pub query_cache_ttl_seconds: u64,
    pub alert_email_enabled: bool,
    pub alert_email_to: Option<String>,
    pub alert_smtp_host: Option<String>,
    pub alert_smtp_port: u16,
    pub alert_smtp_user: Option<String>,
    pub alert_smtp_password: Option<String>,
    pub alert_from_email: Option<String>,
    pub allowed_timeframes: Vec<Timeframe>,
    /// Base URL override for the primary provider (tests point this at a stub).
    pub upstream_base_url: Option<String>,
    pub fallback_base_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let upstream_api_key =
            env::var("UPSTREAM_API_KEY").context("UPSTREAM_API_KEY must be set")?;
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let backfill_schedule_minute = env_parse("BACKFILL_SCHEDULE_MINUTE", 0u32);
        if backfill_schedule_minute > 59 {
            bail!(
                "BACKFILL_SCHEDULE_MINUTE must be 0-59, got {}",
                backfill_schedule_minute
            );
        }

        let allowed_timeframes = match env::var("ALLOWED_TIMEFRAMES") {
            Ok(raw) => {
                let mut parsed = Vec::new();
                for code in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                    match Timeframe::from_str(code) {
                        Some(tf) => parsed.push(tf),
                        None => bail!("ALLOWED_TIMEFRAMES contains unknown code '{}'", code),
                    }
                }
                if parsed.is_empty() {
                    Timeframe::ALL.to_vec()
                } else {
                    parsed
                }
            }
            Err(_) => Timeframe::ALL.to_vec(),
        };

        Ok(Self {
            upstream_api_key,
            database_url,
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: env_parse("API_PORT", 8000u16),
            api_workers: env_parse("API_WORKERS", 4usize),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            backfill_schedule_minute,
            // Accepted for compatibility; only honoured in daily mode.
            backfill_schedule_hour: env_parse("BACKFILL_SCHEDULE_HOUR", 2u32).min(23),
            max_concurrent_symbols: env_parse("MAX_CONCURRENT_SYMBOLS", 3usize).max(1),
            parallel_backfill: env_bool("PARALLEL_BACKFILL", true),
            query_cache_max_size: env_parse("QUERY_CACHE_MAX_SIZE", 1000usize),
            query_cache_ttl_seconds: env_parse("QUERY_CACHE_TTL_SECONDS", 300u64),
            alert_email_enabled: env_bool("ALERT_EMAIL_ENABLED", false),
            alert_email_to: env::var("ALERT_EMAIL_TO").ok(),
            alert_smtp_host: env::var("ALERT_SMTP_HOST").ok(),
            alert_smtp_port: env_parse("ALERT_SMTP_PORT", 587u16),
            alert_smtp_user: env::var("ALERT_SMTP_USER").ok(),
            alert_smtp_password: env::var("ALERT_SMTP_PASSWORD").ok(),
            alert_from_email: env::var("ALERT_FROM_EMAIL").ok(),
            allowed_timeframes,
            upstream_base_url: env::var("UPSTREAM_BASE_URL").ok(),
            fallback_base_url: env::var("FALLBACK_BASE_URL").ok(),
        })
    }

    /// SQLite file path derived from DATABASE_URL. Accepts plain paths and
    /// `sqlite://` URLs.
    pub fn database_path(&self) -> &str {
        self.database_url
            .strip_prefix("sqlite://")
            .unwrap_or(&self.database_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_path_strips_scheme() {
        let mut cfg = test_config();
        cfg.database_url = "sqlite:///tmp/warehouse.db".to_string();
        assert_eq!(cfg.database_path(), "/tmp/warehouse.db");

        cfg.database_url = "./warehouse.db".to_string();
        assert_eq!(cfg.database_path(), "./warehouse.db");
    }

    pub(crate) fn test_config() -> Config {
        Config {
            upstream_api_key: "test-key".to_string(),
            database_url: ":memory:".to_string(),
            api_host: "127.0.0.1".to_string(),
            api_port: 8000,
            api_workers: 4,
            log_level: "INFO".to_string(),
            backfill_schedule_minute: 0,
            backfill_schedule_hour: 2,
            max_concurrent_symbols: 3,
            parallel_backfill: true,
            query_cache_max_size: 1000,
            query_cache_ttl_seconds: 300,
            alert_email_enabled: false,
            alert_email_to: None,
            alert_smtp_host: None,
            alert_smtp_port: 587,
            alert_smtp_user: None,
            alert_smtp_password: None,
            alert_from_email: None,
            allowed_timeframes: Timeframe::ALL.to_vec(),
            upstream_base_url: None,
            fallback_base_url: None,
        }
    }
}

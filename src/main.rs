//! Market-data warehouse server.
//!
//! Boot order: config, tracing, database, upstream clients, orchestrator,
//! observability, scheduler, HTTP. The scheduler is owned here and stopped
//! cooperatively on shutdown, joining in-flight workers.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketdata_warehouse::{
    api::{build_router, AppState, QueryCache},
    config::Config,
    models::{AssetClass, Timeframe},
    observability::{alerts::EmailAlertHandler, AlertManager, MetricsCollector},
    scheduler::Scheduler,
    storage::WarehouseDb,
    upstream::{FallbackClient, MultiSourceOrchestrator, PrimaryClient, RateLimiter},
};

/// Upstream pacing. The paid tier sustains a few requests per second; the
/// free fallback gets a fraction of that.
const PRIMARY_REQUESTS_PER_SECOND: f64 = 5.0;
const FALLBACK_REQUESTS_PER_SECOND: f64 = 1.0;

/// Symbols seeded into an empty registry on first boot.
const BOOTSTRAP_SYMBOLS: &[(&str, AssetClass)] = &[
    ("AAPL", AssetClass::Stock),
    ("MSFT", AssetClass::Stock),
    ("SPY", AssetClass::Etf),
    ("QQQ", AssetClass::Etf),
    ("BTC", AssetClass::Crypto),
    ("ETH", AssetClass::Crypto),
];

fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log_level);

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.api_workers.max(1))
        .enable_all()
        .build()
        .context("failed to build runtime")?
        .block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    info!(
        host = %config.api_host,
        port = config.api_port,
        "market-data warehouse starting"
    );

    let db = WarehouseDb::new(config.database_path())?;
    bootstrap_symbols(&db)?;

    // Upstream clients share a limiter per provider.
    let primary_limiter = Arc::new(RateLimiter::new(PRIMARY_REQUESTS_PER_SECOND));
    let fallback_limiter = Arc::new(RateLimiter::new(FALLBACK_REQUESTS_PER_SECOND));
    let primary = Arc::new(PrimaryClient::new(
        config.upstream_api_key.clone(),
        config.upstream_base_url.clone(),
        primary_limiter,
    )?);
    let fallback = Arc::new(FallbackClient::new(
        config.fallback_base_url.clone(),
        fallback_limiter,
    )?);
    let orchestrator = Arc::new(MultiSourceOrchestrator::new(
        primary.clone(),
        Some(fallback),
    ));

    let alerts = Arc::new(build_alert_manager(&config));
    let metrics = Arc::new(MetricsCollector::new());

    let scheduler = Arc::new(Scheduler::new(
        &config,
        db.clone(),
        orchestrator.clone(),
        alerts.clone(),
        metrics.clone(),
    ));
    scheduler.start();

    let state = AppState {
        db,
        scheduler: scheduler.clone(),
        metrics,
        alerts,
        orchestrator,
        query_cache: Arc::new(QueryCache::new(
            config.query_cache_max_size,
            std::time::Duration::from_secs(config.query_cache_ttl_seconds),
        )),
        allowed_timeframes: config.allowed_timeframes.clone(),
        started_at: Utc::now(),
    };

    let app = build_router(state);
    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "api server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler.clone()))
        .await
        .context("server error")?;

    info!("server exited");
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("marketdata_warehouse={}", log_level.to_lowercase()).into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

fn build_alert_manager(config: &Config) -> AlertManager {
    let manager = AlertManager::new();
    if !config.alert_email_enabled {
        return manager;
    }
    match (&config.alert_email_to, &config.alert_smtp_host) {
        (Some(to), Some(host)) => {
            info!(%to, %host, "email alert handler enabled");
            manager.with_handler(Box::new(EmailAlertHandler {
                to: to.clone(),
                from: config
                    .alert_from_email
                    .clone()
                    .unwrap_or_else(|| "alerts@mdwarehouse.local".to_string()),
                smtp_host: host.clone(),
                smtp_port: config.alert_smtp_port,
            }))
        }
        _ => {
            tracing::warn!(
                "ALERT_EMAIL_ENABLED is set but ALERT_EMAIL_TO/ALERT_SMTP_HOST are missing"
            );
            manager
        }
    }
}

/// Seed a default watchlist the first time the service runs.
fn bootstrap_symbols(db: &WarehouseDb) -> Result<()> {
    if !db.list_all_symbols()?.is_empty() {
        return Ok(());
    }
    info!("empty registry, seeding bootstrap symbols");
    for (symbol, asset_class) in BOOTSTRAP_SYMBOLS {
        db.create_symbol(symbol, *asset_class, &[Timeframe::D1])?;
    }
    Ok(())
}

async fn shutdown_signal(scheduler: Arc<Scheduler>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    scheduler.stop().await;
}

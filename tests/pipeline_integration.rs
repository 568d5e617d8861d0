//! End-to-end pipeline scenarios against deterministic fake upstreams.
//!
//! Covers the happy path, soft and hard validation failures, retry/backoff
//! accounting against a stub HTTP provider, fallback failover, and the
//! authenticated backfill submission flow over a real listener.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use chrono::{DateTime, TimeZone, Utc};
use tempfile::NamedTempFile;
use tokio::sync::watch;

use marketdata_warehouse::{
    api::{build_router, AppState, QueryCache},
    config::Config,
    models::{AssetClass, BackfillStatus, Candle, DataSource, Timeframe},
    observability::{AlertManager, MetricsCollector},
    scheduler::{run_ohlcv_backfill, BackfillRequest, JobContext, Scheduler},
    storage::WarehouseDb,
    upstream::{
        MarketDataSource, MultiSourceOrchestrator, PrimaryClient, RateLimiter, UpstreamError,
    },
    validation,
};

// ---------------------------------------------------------------------------
// Fakes and fixtures
// ---------------------------------------------------------------------------

enum Behavior {
    Candles(Vec<Candle>),
    Unavailable,
    Empty,
}

struct FakeSource {
    source: DataSource,
    behavior: Behavior,
}

#[async_trait]
impl MarketDataSource for FakeSource {
    fn source(&self) -> DataSource {
        self.source
    }

    async fn fetch_range(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _asset_class: AssetClass,
    ) -> Result<Vec<Candle>, UpstreamError> {
        match &self.behavior {
            Behavior::Candles(candles) => Ok(candles.clone()),
            Behavior::Unavailable => Err(UpstreamError::Unavailable("fake outage".to_string())),
            Behavior::Empty => Ok(Vec::new()),
        }
    }
}

fn candle(time: DateTime<Utc>, o: f64, h: f64, l: f64, c: f64, v: f64) -> Candle {
    Candle {
        time,
        open: o,
        high: h,
        low: l,
        close: c,
        volume: v,
    }
}

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
}

fn temp_db() -> (WarehouseDb, NamedTempFile) {
    let file = NamedTempFile::new().unwrap();
    let db = WarehouseDb::new(file.path().to_str().unwrap()).unwrap();
    (db, file)
}

fn job_context(
    db: WarehouseDb,
    primary: Behavior,
    fallback: Option<Behavior>,
) -> (Arc<JobContext>, watch::Sender<bool>) {
    let orchestrator = Arc::new(MultiSourceOrchestrator::new(
        Arc::new(FakeSource {
            source: DataSource::Primary,
            behavior: primary,
        }),
        fallback.map(|behavior| {
            Arc::new(FakeSource {
                source: DataSource::Fallback,
                behavior,
            }) as Arc<dyn MarketDataSource>
        }),
    ));
    let (stop_tx, stop_rx) = watch::channel(false);
    let ctx = Arc::new(JobContext {
        db,
        orchestrator,
        alerts: Arc::new(AlertManager::new()),
        metrics: Arc::new(MetricsCollector::new()),
        max_concurrent_symbols: 3,
        parallel_backfill: true,
        stop: stop_rx,
    });
    (ctx, stop_tx)
}

fn adhoc(symbols: &[&str], start_day: u32, end_day: u32) -> BackfillRequest {
    BackfillRequest::adhoc(
        symbols.iter().map(|s| s.to_string()).collect(),
        day(start_day),
        day(end_day),
        Some(vec![Timeframe::D1]),
    )
}

/// Seed one already-validated candle so subsequent batches have context.
fn seed_candle(db: &WarehouseDb, symbol: &str, c: Candle) {
    let outcome = validation::score_candle(&c, None, None);
    db.insert_candle_batch(symbol, Timeframe::D1, &[(c, outcome)], DataSource::Primary, "seed")
        .unwrap();
}

// ---------------------------------------------------------------------------
// Happy path: one symbol, one day, one clean candle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn single_candle_backfill_happy_path() {
    let (db, _file) = temp_db();
    db.create_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
        .unwrap();

    let bar = candle(day(2), 186.0, 189.0, 185.0, 188.0, 50_000_000.0);
    let (ctx, _stop) = job_context(db.clone(), Behavior::Candles(vec![bar]), None);

    let summary = run_ohlcv_backfill(&ctx, adhoc(&["AAPL"], 2, 3)).await;
    assert_eq!(summary.pairs_succeeded, 1);
    assert_eq!(summary.pairs_failed, 0);
    assert_eq!(summary.records_inserted, 1);

    let rows = db
        .query_candles("AAPL", Timeframe::D1, &Default::default())
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].validated);
    assert_eq!(rows[0].quality_score, 1.0);
    assert_eq!(rows[0].source, DataSource::Primary);

    let states = db.list_recent_backfill_states(10).unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].status, BackfillStatus::Completed);
    assert_eq!(states[0].records_inserted, 1);

    // The symbol-level streak reflects the success.
    let failure = db.get_failure_record("AAPL").unwrap().unwrap();
    assert_eq!(failure.consecutive_failures, 0);
}

// ---------------------------------------------------------------------------
// An opening gap soft-fails but stays validated
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn opening_gap_soft_fails_but_validates() {
    let (db, _file) = temp_db();
    db.create_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
        .unwrap();
    seed_candle(&db, "AAPL", candle(day(1), 99.0, 101.0, 98.0, 100.0, 1_000.0));

    let gapped = candle(day(2), 115.0, 116.0, 114.0, 115.5, 1_000.0);
    let (ctx, _stop) = job_context(db.clone(), Behavior::Candles(vec![gapped]), None);
    run_ohlcv_backfill(&ctx, adhoc(&["AAPL"], 2, 3)).await;

    let rows = db
        .query_candles("AAPL", Timeframe::D1, &Default::default())
        .unwrap();
    assert_eq!(rows.len(), 2);
    let row = &rows[1];
    assert!(row.gap_detected);
    assert!((row.quality_score - 0.9).abs() < 1e-9);
    assert!(row.validated);
}

// ---------------------------------------------------------------------------
// An extreme price move hard-fails but the row is still persisted
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn extreme_move_persists_unvalidated() {
    let (db, _file) = temp_db();
    db.create_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
        .unwrap();
    seed_candle(&db, "AAPL", candle(day(1), 99.0, 101.0, 98.0, 100.0, 1_000.0));

    let wild = candle(day(2), 700.0, 800.0, 650.0, 750.0, 1_000.0);
    let (ctx, _stop) = job_context(db.clone(), Behavior::Candles(vec![wild]), None);
    run_ohlcv_backfill(&ctx, adhoc(&["AAPL"], 2, 3)).await;

    let rows = db
        .query_candles("AAPL", Timeframe::D1, &Default::default())
        .unwrap();
    assert_eq!(rows.len(), 2);
    let row = &rows[1];
    assert!(row.quality_score <= 0.6);
    assert!(!row.validated);
    assert_eq!(row.candle.close, 750.0);
}

// ---------------------------------------------------------------------------
// 429 twice then success: retries, counters, backoff delays
// ---------------------------------------------------------------------------

async fn flaky_provider(State(hits): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    let n = hits.fetch_add(1, Ordering::SeqCst);
    if n < 2 {
        (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response()
    } else {
        let body = serde_json::json!({
            "status": "OK",
            "results": [
                {"t": 1704153600000i64, "o": 186.0, "h": 189.0, "l": 185.0, "c": 188.0, "v": 50000000.0}
            ]
        });
        axum::Json(body).into_response()
    }
}

#[tokio::test]
async fn rate_limited_then_success_counts_and_backs_off() {
    let hits = Arc::new(AtomicUsize::new(0));
    let stub = Router::new()
        .route("/v2/aggs/ticker/:ticker/range/:mult/:span/:from/:to", get(flaky_provider))
        .with_state(hits.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, stub).await.unwrap();
    });

    let client = PrimaryClient::new(
        "test-key".to_string(),
        Some(format!("http://{addr}")),
        Arc::new(RateLimiter::new(100.0)),
    )
    .unwrap();

    let started = std::time::Instant::now();
    let candles = client
        .fetch_range("AAPL", Timeframe::D1, day(2), day(3), AssetClass::Stock)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(candles.len(), 1);
    assert_eq!(candles[0].close, 188.0);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(client.total_requests(), 3);
    assert_eq!(client.rate_limited_count(), 2);
    // Two backoff rounds (1s and 2s nominal, with jitter no less than 80%).
    assert!(elapsed >= Duration::from_millis(2_300), "elapsed {elapsed:?}");
}

// ---------------------------------------------------------------------------
// Primary down, fallback carries the window
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn fallback_carries_window_when_primary_down() {
    let (db, _file) = temp_db();
    db.create_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
        .unwrap();

    let bars: Vec<Candle> = (2..7)
        .map(|d| candle(day(d), 100.0 + d as f64, 102.0 + d as f64, 99.0 + d as f64, 101.0 + d as f64, 1_000.0))
        .collect();
    let (ctx, _stop) = job_context(
        db.clone(),
        Behavior::Unavailable,
        Some(Behavior::Candles(bars)),
    );

    let summary = run_ohlcv_backfill(&ctx, adhoc(&["AAPL"], 2, 7)).await;
    assert_eq!(summary.records_inserted, 5);
    assert_eq!(summary.pairs_failed, 0);

    let rows = db
        .query_candles("AAPL", Timeframe::D1, &Default::default())
        .unwrap();
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|r| r.source == DataSource::Fallback));

    let states = db.list_recent_backfill_states(10).unwrap();
    assert_eq!(states[0].status, BackfillStatus::Completed);
    assert_eq!(ctx.orchestrator.stats().fallback_used, 1);
}

// ---------------------------------------------------------------------------
// Boundary: empty upstream window completes with zero records, no anomaly
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn empty_window_completes_clean() {
    let (db, _file) = temp_db();
    db.create_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
        .unwrap();

    let (ctx, _stop) = job_context(db.clone(), Behavior::Empty, Some(Behavior::Empty));
    let summary = run_ohlcv_backfill(&ctx, adhoc(&["AAPL"], 2, 3)).await;
    assert_eq!(summary.pairs_succeeded, 1);
    assert_eq!(summary.records_inserted, 0);

    let states = db.list_recent_backfill_states(10).unwrap();
    assert_eq!(states[0].status, BackfillStatus::Completed);
    assert_eq!(states[0].records_inserted, 0);
    assert_eq!(db.total_anomalies().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Boundary: both sources down marks the pair failed and trips the streak
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn outage_marks_pair_failed() {
    let (db, _file) = temp_db();
    db.create_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
        .unwrap();

    let (ctx, _stop) = job_context(db.clone(), Behavior::Unavailable, Some(Behavior::Unavailable));
    let summary = run_ohlcv_backfill(&ctx, adhoc(&["AAPL"], 2, 3)).await;
    assert_eq!(summary.pairs_failed, 1);

    let states = db.list_recent_backfill_states(10).unwrap();
    assert_eq!(states[0].status, BackfillStatus::Failed);
    assert!(states[0].error_message.as_deref().unwrap().contains("upstream"));

    let failure = db.get_failure_record("AAPL").unwrap().unwrap();
    assert_eq!(failure.consecutive_failures, 1);
}

// ---------------------------------------------------------------------------
// Boundary: a broken candle is dropped, the rest of the batch lands
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn broken_candle_skipped_rest_persisted() {
    let (db, _file) = temp_db();
    db.create_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
        .unwrap();

    let mut broken = candle(day(2), 100.0, 90.0, 95.0, 100.0, 1_000.0);
    broken.high = 90.0; // below both open and close
    let fine = candle(day(3), 100.0, 102.0, 99.0, 101.0, 1_000.0);
    let (ctx, _stop) = job_context(db.clone(), Behavior::Candles(vec![broken, fine]), None);

    let summary = run_ohlcv_backfill(&ctx, adhoc(&["AAPL"], 2, 4)).await;
    assert_eq!(summary.records_inserted, 1);

    let rows = db
        .query_candles("AAPL", Timeframe::D1, &Default::default())
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].candle.close, 101.0);

    // The dropped row is visible in the anomaly log.
    assert_eq!(db.total_anomalies().unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Idempotence: running the same window twice inserts once
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rerun_is_idempotent() {
    let (db, _file) = temp_db();
    db.create_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
        .unwrap();

    let bar = candle(day(2), 186.0, 189.0, 185.0, 188.0, 50_000_000.0);
    let (ctx, _stop) = job_context(db.clone(), Behavior::Candles(vec![bar]), None);

    let first = run_ohlcv_backfill(&ctx, adhoc(&["AAPL"], 2, 3)).await;
    let second = run_ohlcv_backfill(&ctx, adhoc(&["AAPL"], 2, 3)).await;
    assert_eq!(first.records_inserted, 1);
    assert_eq!(second.records_inserted, 0);
    assert_eq!(db.total_candles().unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Cancellation: a raised stop flag prevents new work
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stop_flag_prevents_new_work() {
    let (db, _file) = temp_db();
    db.create_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
        .unwrap();

    let bar = candle(day(2), 186.0, 189.0, 185.0, 188.0, 50_000_000.0);
    let (ctx, stop_tx) = job_context(db.clone(), Behavior::Candles(vec![bar]), None);
    stop_tx.send(true).unwrap();

    let summary = run_ohlcv_backfill(&ctx, adhoc(&["AAPL"], 2, 3)).await;
    assert_eq!(summary.pairs_succeeded, 0);
    assert_eq!(summary.pairs_failed, 0);
    assert_eq!(db.total_candles().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Feature idempotence over ingested data
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn feature_recompute_is_stable() {
    let (db, _file) = temp_db();
    db.create_symbol("AAPL", AssetClass::Stock, &[Timeframe::D1])
        .unwrap();

    let bars: Vec<Candle> = (1..28)
        .map(|d| {
            let c = 100.0 + d as f64;
            candle(day(d), c - 1.0, c + 1.0, c - 2.0, c, 1_000.0)
        })
        .collect();
    let (ctx, _stop) = job_context(db.clone(), Behavior::Candles(bars), None);
    run_ohlcv_backfill(&ctx, adhoc(&["AAPL"], 1, 28)).await;

    marketdata_warehouse::scheduler::enrichment::run_feature_enrichment(&ctx).await;
    let first = db
        .query_candles_with_features("AAPL", Timeframe::D1, &Default::default())
        .unwrap();

    marketdata_warehouse::scheduler::enrichment::run_feature_enrichment(&ctx).await;
    let second = db
        .query_candles_with_features("AAPL", Timeframe::D1, &Default::default())
        .unwrap();

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.features.log_return, b.features.log_return);
        assert_eq!(a.features.volatility_20, b.features.volatility_20);
        assert_eq!(a.features.atr_14, b.features.atr_14);
        assert_eq!(a.features.structure_label, b.features.structure_label);
    }
    // Later rows of a 27-bar series have full short-window coverage.
    assert!(first.last().unwrap().features.volatility_20.is_some());
    assert!(first.last().unwrap().features.structure_label.is_some());
}

// ---------------------------------------------------------------------------
// Auth, audit, and backfill submission over HTTP
// ---------------------------------------------------------------------------

fn test_config() -> Config {
    Config {
        upstream_api_key: "test".to_string(),
        database_url: ":memory:".to_string(),
        api_host: "127.0.0.1".to_string(),
        api_port: 0,
        api_workers: 1,
        log_level: "INFO".to_string(),
        backfill_schedule_minute: 0,
        backfill_schedule_hour: 2,
        max_concurrent_symbols: 3,
        parallel_backfill: false,
        query_cache_max_size: 100,
        query_cache_ttl_seconds: 60,
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

async fn serve_app(db: WarehouseDb, primary: Behavior) -> (SocketAddr, AppState) {
    let orchestrator = Arc::new(MultiSourceOrchestrator::new(
        Arc::new(FakeSource {
            source: DataSource::Primary,
            behavior: primary,
        }),
        None,
    ));
    let alerts = Arc::new(AlertManager::new());
    let metrics = Arc::new(MetricsCollector::new());
    let scheduler = Arc::new(Scheduler::new(
        &test_config(),
        db.clone(),
        orchestrator.clone(),
        alerts.clone(),
        metrics.clone(),
    ));

    let state = AppState {
        db,
        scheduler,
        metrics,
        alerts,
        orchestrator,
        query_cache: Arc::new(QueryCache::new(100, Duration::from_secs(60))),
        allowed_timeframes: Timeframe::ALL.to_vec(),
        started_at: Utc::now(),
    };

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

#[tokio::test]
async fn auth_audit_and_backfill_submission() {
    let (db, _file) = temp_db();
    let bar = candle(day(2), 186.0, 189.0, 185.0, 188.0, 50_000_000.0);
    let (addr, state) = serve_app(db.clone(), Behavior::Candles(vec![bar])).await;
    let http = reqwest::Client::new();

    let body = serde_json::json!({
        "symbols": ["AAPL", "MSFT"],
        "start_date": "2024-01-01",
        "end_date": "2024-01-31",
    });

    // Unknown key is rejected and audited.
    let resp = http
        .post(format!("http://{addr}/api/v1/backfill"))
        .header("X-API-Key", "mdw_bogus")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let audit = db.list_api_key_audit(10).unwrap();
    assert_eq!(audit[0].outcome, "denied");

    // Missing key is also rejected.
    let resp = http
        .post(format!("http://{addr}/api/v1/backfill"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // A real key goes through and gets a job id.
    let created = db.create_api_key("ops").unwrap();
    let resp = http
        .post(format!("http://{addr}/api/v1/backfill"))
        .header("X-API-Key", &created.key_material)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let payload: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(payload["status"], "queued");
    assert!(payload["job_id"].as_str().is_some());

    // Both (symbol, timeframe) executions reach completed.
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    loop {
        let states = state.db.list_recent_backfill_states(10).unwrap();
        let completed = states
            .iter()
            .filter(|s| s.status == BackfillStatus::Completed)
            .count();
        if completed == 2 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "backfill did not complete in time: {states:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let audit = db.list_api_key_audit(10).unwrap();
    assert!(audit.iter().any(|row| row.outcome == "ok"));
}

#[tokio::test]
async fn unknown_timeframe_is_rejected_without_writes() {
    let (db, _file) = temp_db();
    let (addr, _state) = serve_app(db.clone(), Behavior::Empty).await;
    let http = reqwest::Client::new();

    let resp = http
        .get(format!("http://{addr}/api/v1/historical/AAPL?timeframe=3m"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let payload: serde_json::Value = resp.json().await.unwrap();
    assert!(payload["detail"].as_str().unwrap().contains("timeframe"));
    assert_eq!(db.total_candles().unwrap(), 0);
}

#[tokio::test]
async fn oversized_backfill_request_is_rejected() {
    let (db, _file) = temp_db();
    let (addr, state) = serve_app(db.clone(), Behavior::Empty).await;
    let http = reqwest::Client::new();
    let created = db.create_api_key("ops").unwrap();

    let symbols: Vec<String> = (0..101).map(|i| format!("SYM{i}")).collect();
    let resp = http
        .post(format!("http://{addr}/api/v1/backfill"))
        .header("X-API-Key", &created.key_material)
        .json(&serde_json::json!({
            "symbols": symbols,
            "start_date": "2024-01-01",
            "end_date": "2024-01-31",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Nothing was processed.
    assert!(state.db.list_recent_backfill_states(10).unwrap().is_empty());
}

#[tokio::test]
async fn historical_endpoint_serves_ingested_rows() {
    let (db, _file) = temp_db();
    seed_candle(&db, "AAPL", candle(day(2), 186.0, 189.0, 185.0, 188.0, 1_000.0));
    let (addr, _state) = serve_app(db.clone(), Behavior::Empty).await;
    let http = reqwest::Client::new();

    let resp = http
        .get(format!(
            "http://{addr}/api/v1/historical/aapl?timeframe=1d&start=2024-01-01&end=2024-01-05"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let payload: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(payload["count"], 1);
    assert_eq!(payload["candles"][0]["close"], 188.0);

    // Out-of-range windows are a 404, not an empty 200.
    let resp = http
        .get(format!(
            "http://{addr}/api/v1/historical/AAPL?timeframe=1d&start=2023-01-01&end=2023-01-05"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Bad date ordering is a 400.
    let resp = http
        .get(format!(
            "http://{addr}/api/v1/historical/AAPL?timeframe=1d&start=2024-02-01&end=2024-01-05"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

//! Public (unauthenticated) query endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::AppState;
use crate::models::Timeframe;
use crate::storage::CandleQuery;

fn parse_timeframe(state: &AppState, raw: Option<&str>) -> Result<Timeframe, ApiError> {
    let code = raw.unwrap_or("1d");
    let timeframe = Timeframe::from_str(code)
        .ok_or_else(|| ApiError::bad_request(format!("unknown timeframe '{code}'")))?;
    if !state.allowed_timeframes.contains(&timeframe) {
        return Err(ApiError::bad_request(format!(
            "timeframe '{code}' is not enabled"
        )));
    }
    Ok(timeframe)
}

/// `YYYY-MM-DD`, midnight UTC.
fn parse_date(raw: &str, field: &str) -> Result<DateTime<Utc>, ApiError> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request(format!("{field} must be YYYY-MM-DD, got '{raw}'")))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| ApiError::bad_request(format!("{field} out of range")))?;
    Ok(DateTime::from_naive_utc_and_offset(midnight, Utc))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "scheduler_running": state.scheduler.is_running(),
    }))
}

pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let total_candles = state.db.total_candles()?;
    let validation_rate = state.db.validation_rate()?;
    let symbols = state.db.list_active_symbols()?;
    let anomalies = state.db.total_anomalies()?;
    let latest_run = state.db.latest_run_summary()?;
    let recent_backfills = state.db.list_recent_backfill_states(20)?;
    let active_backfills = state.db.list_active_backfill_states()?;

    Ok(Json(json!({
        "total_candles": total_candles,
        "active_symbols": symbols.len(),
        "validation_rate": validation_rate,
        "total_anomalies": anomalies,
        "scheduler_running": state.scheduler.is_running(),
        "health_status": state.metrics.health_status(),
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "latest_run": latest_run,
        "recent_backfills": recent_backfills,
        "active_backfills": active_backfills,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HistoricalParams {
    pub timeframe: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    #[serde(default)]
    pub validated_only: bool,
    pub min_quality: Option<f64>,
    pub limit: Option<usize>,
}

fn build_candle_query(params: &HistoricalParams) -> Result<CandleQuery, ApiError> {
    let start = params
        .start
        .as_deref()
        .map(|s| parse_date(s, "start"))
        .transpose()?;
    let end = params
        .end
        .as_deref()
        .map(|s| parse_date(s, "end"))
        .transpose()?;
    if let (Some(start), Some(end)) = (start, end) {
        if start >= end {
            return Err(ApiError::bad_request("start must be before end"));
        }
    }
    Ok(CandleQuery {
        start,
        end,
        validated_only: params.validated_only,
        min_quality: params.min_quality,
        limit: params.limit,
    })
}

/// Seconds since the latest stored candle, and whether that breaches the
/// timeframe's freshness threshold.
fn staleness_hint(
    state: &AppState,
    symbol: &str,
    timeframe: Timeframe,
) -> Result<(Option<i64>, bool), ApiError> {
    match state.db.latest_candle(symbol, timeframe)? {
        Some(latest) => {
            let age = Utc::now() - latest.candle.time;
            Ok((
                Some(age.num_seconds()),
                age > timeframe.staleness_threshold(),
            ))
        }
        None => Ok((None, false)),
    }
}

pub async fn historical(
    Path(symbol): Path<String>,
    Query(params): Query<HistoricalParams>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let symbol = symbol.to_uppercase();
    let timeframe = parse_timeframe(&state, params.timeframe.as_deref())?;
    let query = build_candle_query(&params)?;

    let cache_key = format!(
        "historical:{symbol}:{}:{:?}:{:?}:{}:{:?}:{:?}",
        timeframe.as_str(),
        query.start,
        query.end,
        query.validated_only,
        query.min_quality,
        query.limit,
    );
    if let Some(cached) = state.query_cache.get(&cache_key) {
        return Ok(Json(cached));
    }

    let rows = state.db.query_candles(&symbol, timeframe, &query)?;
    if rows.is_empty() {
        return Err(ApiError::not_found(format!(
            "no data for {symbol} {} in the requested range",
            timeframe.as_str()
        )));
    }

    let (staleness_seconds, stale) = staleness_hint(&state, &symbol, timeframe)?;
    let body = json!({
        "symbol": symbol,
        "timeframe": timeframe.as_str(),
        "count": rows.len(),
        "staleness_seconds": staleness_seconds,
        "stale": stale,
        "candles": rows,
    });
    state.query_cache.put(cache_key, body.clone());
    Ok(Json(body))
}

pub async fn quant_features(
    Path(symbol): Path<String>,
    Query(params): Query<HistoricalParams>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let symbol = symbol.to_uppercase();
    let timeframe = parse_timeframe(&state, params.timeframe.as_deref())?;
    let query = build_candle_query(&params)?;

    let rows = state
        .db
        .query_candles_with_features(&symbol, timeframe, &query)?;
    if rows.is_empty() {
        return Err(ApiError::not_found(format!(
            "no data for {symbol} {} in the requested range",
            timeframe.as_str()
        )));
    }

    let (staleness_seconds, stale) = staleness_hint(&state, &symbol, timeframe)?;
    Ok(Json(json!({
        "symbol": symbol,
        "timeframe": timeframe.as_str(),
        "count": rows.len(),
        "staleness_seconds": staleness_seconds,
        "stale": stale,
        "candles": rows,
    })))
}

pub async fn list_symbols(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let symbols: Vec<String> = state
        .db
        .list_active_symbols()?
        .into_iter()
        .map(|s| s.symbol)
        .collect();
    Ok(Json(json!({ "symbols": symbols })))
}

pub async fn list_symbols_detailed(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let symbols = state.db.list_all_symbols()?;
    Ok(Json(json!({ "symbols": symbols })))
}

pub async fn observability_metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "health_status": state.metrics.health_status(),
        "endpoints": state.metrics.snapshot(),
        "orchestrator": state.orchestrator.stats(),
        "alert_handlers": state.alerts.handler_names(),
        "query_cache_entries": state.query_cache.len(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct AlertParams {
    pub limit: Option<usize>,
}

pub async fn observability_alerts(
    Query(params): Query<AlertParams>,
    State(state): State<AppState>,
) -> Json<Value> {
    let alerts = state.alerts.recent(params.limit.unwrap_or(100));
    Json(json!({ "count": alerts.len(), "alerts": alerts }))
}

/// Route listing in lieu of a full generated schema.
pub async fn docs() -> Json<Value> {
    Json(json!({
        "service": "marketdata-warehouse",
        "endpoints": {
            "public": [
                "GET /health",
                "GET /api/v1/status",
                "GET /api/v1/historical/{symbol}?timeframe&start&end&validated_only&min_quality&limit",
                "GET /api/v1/features/quant/{symbol}?timeframe&start&end&limit",
                "GET /api/v1/symbols",
                "GET /api/v1/symbols/detailed",
                "GET /api/v1/observability/metrics",
                "GET /api/v1/observability/alerts?limit",
            ],
            "admin (X-API-Key)": [
                "POST /api/v1/symbols",
                "DELETE /api/v1/symbols/{symbol}",
                "PUT /api/v1/symbols/{symbol}/timeframes",
                "POST /api/v1/backfill",
                "POST /api/v1/admin/api-keys",
                "GET /api/v1/admin/api-keys",
                "GET /api/v1/admin/api-keys/audit",
                "DELETE /api/v1/admin/api-keys/{id}",
            ],
        },
    }))
}

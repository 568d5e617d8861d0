//! Admin endpoints, behind API-key auth.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::error::ApiError;
use super::AppState;
use crate::models::{AssetClass, Timeframe};
use crate::scheduler::BackfillRequest;

const MAX_BACKFILL_SYMBOLS: usize = 100;

fn parse_timeframes(
    state: &AppState,
    codes: &[String],
) -> Result<Vec<Timeframe>, ApiError> {
    let mut parsed = Vec::with_capacity(codes.len());
    for code in codes {
        let timeframe = Timeframe::from_str(code)
            .ok_or_else(|| ApiError::bad_request(format!("unknown timeframe '{code}'")))?;
        if !state.allowed_timeframes.contains(&timeframe) {
            return Err(ApiError::bad_request(format!(
                "timeframe '{code}' is not enabled"
            )));
        }
        if !parsed.contains(&timeframe) {
            parsed.push(timeframe);
        }
    }
    Ok(parsed)
}

fn parse_date(raw: &str, field: &str) -> Result<DateTime<Utc>, ApiError> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request(format!("{field} must be YYYY-MM-DD, got '{raw}'")))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| ApiError::bad_request(format!("{field} out of range")))?;
    Ok(DateTime::from_naive_utc_and_offset(midnight, Utc))
}

#[derive(Debug, Deserialize)]
pub struct CreateSymbolBody {
    pub symbol: String,
    pub asset_class: Option<String>,
    #[serde(default)]
    pub timeframes: Vec<String>,
}

pub async fn create_symbol(
    State(state): State<AppState>,
    Json(body): Json<CreateSymbolBody>,
) -> Result<Json<Value>, ApiError> {
    if body.symbol.trim().is_empty() {
        return Err(ApiError::bad_request("symbol must not be empty"));
    }
    let asset_class = match body.asset_class.as_deref() {
        Some(raw) => AssetClass::from_str(raw)
            .ok_or_else(|| ApiError::bad_request(format!("unknown asset class '{raw}'")))?,
        None => AssetClass::Stock,
    };
    let timeframes = parse_timeframes(&state, &body.timeframes)?;

    let record = state
        .db
        .create_symbol(&body.symbol, asset_class, &timeframes)?;
    Ok(Json(json!({ "symbol": record })))
}

pub async fn deactivate_symbol(
    Path(symbol): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let symbol = symbol.to_uppercase();
    if !state.db.deactivate_symbol(&symbol)? {
        return Err(ApiError::not_found(format!("unknown symbol '{symbol}'")));
    }
    Ok(Json(json!({ "symbol": symbol, "active": false })))
}

#[derive(Debug, Deserialize)]
pub struct TimeframesBody {
    pub timeframes: Vec<String>,
}

pub async fn update_timeframes(
    Path(symbol): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<TimeframesBody>,
) -> Result<Json<Value>, ApiError> {
    let symbol = symbol.to_uppercase();
    let timeframes = parse_timeframes(&state, &body.timeframes)?;
    if !state.db.update_symbol_timeframes(&symbol, &timeframes)? {
        return Err(ApiError::not_found(format!("unknown symbol '{symbol}'")));
    }
    let record = state
        .db
        .get_symbol(&symbol)?
        .ok_or_else(|| ApiError::not_found(format!("unknown symbol '{symbol}'")))?;
    Ok(Json(json!({ "symbol": record })))
}

#[derive(Debug, Deserialize)]
pub struct BackfillBody {
    pub symbols: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    pub timeframes: Option<Vec<String>>,
}

/// Validate and enqueue an ad-hoc backfill. Returns immediately with the job
/// id; progress is visible through backfill state.
pub async fn submit_backfill(
    State(state): State<AppState>,
    Json(body): Json<BackfillBody>,
) -> Result<Json<Value>, ApiError> {
    if body.symbols.is_empty() || body.symbols.len() > MAX_BACKFILL_SYMBOLS {
        return Err(ApiError::bad_request(format!(
            "symbols must contain between 1 and {MAX_BACKFILL_SYMBOLS} entries"
        )));
    }
    let start = parse_date(&body.start_date, "start_date")?;
    let end = parse_date(&body.end_date, "end_date")?;
    if start >= end {
        return Err(ApiError::bad_request("start_date must be before end_date"));
    }
    let timeframes = body
        .timeframes
        .as_deref()
        .map(|codes| parse_timeframes(&state, codes))
        .transpose()?;

    let symbols: Vec<String> = body
        .symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        return Err(ApiError::bad_request("symbols must not be blank"));
    }

    let request = BackfillRequest::adhoc(symbols.clone(), start, end, timeframes);
    let job_id = state.scheduler.submit_adhoc(request);
    info!(%job_id, symbols = symbols.len(), "ad-hoc backfill queued");

    Ok(Json(json!({ "job_id": job_id, "status": "queued" })))
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    pub name: String,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Json(body): Json<CreateKeyBody>,
) -> Result<Json<Value>, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    let created = state.db.create_api_key(body.name.trim())?;
    // The raw key appears in this response and nowhere else.
    Ok(Json(json!({
        "id": created.id,
        "name": created.name,
        "key": created.key_material,
    })))
}

pub async fn list_api_keys(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let keys = state.db.list_api_keys()?;
    Ok(Json(json!({ "keys": keys })))
}

pub async fn revoke_api_key(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    if !state.db.revoke_api_key(&id)? {
        return Err(ApiError::not_found(format!("unknown api key '{id}'")));
    }
    Ok(Json(json!({ "id": id, "active": false })))
}

#[derive(Debug, Deserialize)]
pub struct AuditParams {
    pub limit: Option<usize>,
}

pub async fn api_key_audit(
    Query(params): Query<AuditParams>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let rows = state.db.list_api_key_audit(params.limit.unwrap_or(200))?;
    Ok(Json(json!({ "count": rows.len(), "audit": rows })))
}

//! HTTP surface.
//!
//! Public query endpoints sit under permissive CORS; admin endpoints are
//! gated by the API-key middleware. Every request gets a trace id, a latency
//! log line, and a metrics sample.

pub mod admin;
pub mod auth;
pub mod cache;
pub mod error;
pub mod public;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use tower_http::cors::CorsLayer;
use tracing::{info, Instrument};

use crate::observability::{new_trace_id, AlertManager, MetricsCollector};
use crate::scheduler::Scheduler;
use crate::storage::WarehouseDb;
use crate::upstream::MultiSourceOrchestrator;

pub use cache::QueryCache;

/// Application state shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: WarehouseDb,
    pub scheduler: Arc<Scheduler>,
    pub metrics: Arc<MetricsCollector>,
    pub alerts: Arc<AlertManager>,
    pub orchestrator: Arc<MultiSourceOrchestrator>,
    pub query_cache: Arc<QueryCache>,
    pub allowed_timeframes: Vec<crate::models::Timeframe>,
    pub started_at: DateTime<Utc>,
}

/// Assemble the full router.
pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/api/v1/symbols", post(admin::create_symbol))
        .route("/api/v1/symbols/:symbol", delete(admin::deactivate_symbol))
        .route(
            "/api/v1/symbols/:symbol/timeframes",
            put(admin::update_timeframes),
        )
        .route("/api/v1/backfill", post(admin::submit_backfill))
        .route("/api/v1/admin/api-keys", post(admin::create_api_key))
        .route("/api/v1/admin/api-keys", get(admin::list_api_keys))
        .route("/api/v1/admin/api-keys/audit", get(admin::api_key_audit))
        .route("/api/v1/admin/api-keys/:id", delete(admin::revoke_api_key))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    let public_routes = Router::new()
        .route("/health", get(public::health))
        .route("/docs", get(public::docs))
        .route("/api/v1/status", get(public::status))
        .route("/api/v1/historical/:symbol", get(public::historical))
        .route("/api/v1/features/quant/:symbol", get(public::quant_features))
        .route("/api/v1/symbols", get(public::list_symbols))
        .route("/api/v1/symbols/detailed", get(public::list_symbols_detailed))
        .route(
            "/api/v1/observability/metrics",
            get(public::observability_metrics),
        )
        .route(
            "/api/v1/observability/alerts",
            get(public::observability_alerts),
        );

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            track_request,
        ))
        .with_state(state)
}

/// Per-request trace id, latency log line, and metrics sample.
async fn track_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let trace_id = new_trace_id();

    let span = tracing::info_span!("http_request", %trace_id, method = %method, path = %path);

    let start = Instant::now();
    let response = next.run(request).instrument(span).await;
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    let status = response.status().as_u16();

    // Health probes are noisy and carry no signal.
    if path != "/health" {
        state
            .metrics
            .record(&path, latency_ms, response.status().is_server_error());
        info!(
            %trace_id,
            method = %method,
            path = %path,
            status,
            latency_ms = latency_ms as u64,
            "request completed"
        );
    }

    response
}

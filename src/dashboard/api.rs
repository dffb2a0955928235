//! Dashboard HTTP API
//!
//! Read-only REST endpoints. Nothing here writes to the ledger.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use super::types::*;
use super::DashboardState;
use crate::error::EngineError;

/// Create the API router with all endpoints
pub fn create_router(state: DashboardState) -> Router {
    Router::new()
        // Signal / session / backtest reads
        .route("/api/signal/:symbol", get(get_signal))
        .route("/api/session", get(get_session))
        .route("/api/backtest", get(get_backtest))
        // Calibration views
        .route("/api/accuracy", get(get_accuracy))
        .route("/api/patterns", get(get_patterns))
        .route("/api/weights", get(get_weights))
        .route("/api/health", get(get_health))
        // State
        .with_state(state)
        // CORS for frontend
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

fn storage_error<T: serde::Serialize>(endpoint: &str, e: EngineError) -> Json<ApiResponse<T>> {
    error!(endpoint, error = %e, "Dashboard read failed");
    Json(ApiResponse::error(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────

/// GET /api/signal/:symbol - Latest fused signal
async fn get_signal(
    State(state): State<DashboardState>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let symbol = symbol.to_uppercase();
    match state.latest_signal(&symbol) {
        Ok(Some(signal)) => Json(ApiResponse::success(SignalResponse::from(signal))),
        Ok(None) => Json(ApiResponse::error(format!("no signal for {}", symbol))),
        Err(e) => storage_error("signal", e),
    }
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    at: Option<DateTime<Utc>>,
}

/// GET /api/session - Session analysis for now (or `?at=`)
async fn get_session(
    State(state): State<DashboardState>,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    let at = query.at.unwrap_or_else(Utc::now);
    match state.session_analysis(at) {
        Ok(analysis) => Json(ApiResponse::success(SessionResponse::from(analysis))),
        Err(e) => storage_error("session", e),
    }
}

#[derive(Debug, Deserialize)]
struct BacktestQuery {
    symbol: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

/// GET /api/backtest?symbol=&from=&to= - Backtest summary
async fn get_backtest(
    State(state): State<DashboardState>,
    Query(query): Query<BacktestQuery>,
) -> impl IntoResponse {
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Json(ApiResponse::<BacktestResponse>::error(
                "'from' must not be after 'to'",
            ));
        }
    }
    let symbol = query.symbol.map(|s| s.to_uppercase());
    match state.backtest(symbol.as_deref(), query.from, query.to) {
        Ok(summary) => Json(ApiResponse::success(BacktestResponse::from(summary))),
        Err(e) => storage_error("backtest", e),
    }
}

#[derive(Debug, Deserialize)]
struct AccuracyQuery {
    symbol: Option<String>,
}

/// GET /api/accuracy - Rolling accuracy and calibration quality
async fn get_accuracy(
    State(state): State<DashboardState>,
    Query(query): Query<AccuracyQuery>,
) -> impl IntoResponse {
    let symbol = query.symbol.map(|s| s.to_uppercase());
    match state.accuracy(symbol.as_deref(), Utc::now()) {
        Ok(metrics) => Json(ApiResponse::success(AccuracyResponse::from(metrics))),
        Err(e) => storage_error("accuracy", e),
    }
}

#[derive(Debug, Deserialize)]
struct PatternQuery {
    #[serde(default)]
    active: bool,
}

/// GET /api/patterns?active=true - Mined patterns
async fn get_patterns(
    State(state): State<DashboardState>,
    Query(query): Query<PatternQuery>,
) -> impl IntoResponse {
    match state.patterns(query.active) {
        Ok(patterns) => Json(ApiResponse::success(
            patterns
                .into_iter()
                .map(PatternResponse::from)
                .collect::<Vec<_>>(),
        )),
        Err(e) => storage_error("patterns", e),
    }
}

/// GET /api/weights - Current weight version and recent history
async fn get_weights(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.weights() {
        Ok(weights) => Json(ApiResponse::success(weights)),
        Err(e) => storage_error("weights", e),
    }
}

/// GET /api/health - Liveness plus ledger reachability
async fn get_health(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.health(Utc::now()) {
        Ok(health) => Json(ApiResponse::success(health)),
        Err(e) => storage_error("health", e),
    }
}

// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`: the scan and parameter entrypoints
// plus health and the current regime.  There is no authentication layer.
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::error::RegistryError;
use crate::types::InstrumentId;

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        // ── Scans ───────────────────────────────────────────────────
        .route("/api/v1/scans", post(trigger_scan))
        .route("/api/v1/scans/:scan_id", get(scan_result))
        // ── Parameters ──────────────────────────────────────────────
        .route("/api/v1/parameters", get(parameters))
        .route("/api/v1/parameters/:parameter_id", get(parameter))
        // ── Regime ──────────────────────────────────────────────────
        .route("/api/v1/regime", get(regime))
        .layer(cors)
        .with_state(state)
}

fn error_body(status: StatusCode, message: String) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    uptime_secs: u64,
    decisions: usize,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        decisions: state.tracker.len(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Scans
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct TriggerScanRequest {
    /// Empty or absent scans the configured universe.
    #[serde(default)]
    instrument_ids: Vec<InstrumentId>,
}

#[derive(Serialize)]
struct TriggerScanResponse {
    scan_id: String,
}

/// An empty body scans the universe; a malformed one is rejected.
async fn trigger_scan(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> axum::response::Response {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        TriggerScanRequest::default()
    } else {
        match serde_json::from_slice::<TriggerScanRequest>(&body) {
            Ok(req) => req,
            Err(e) => {
                return error_body(StatusCode::BAD_REQUEST, format!("invalid scan request: {e}"))
            }
        }
    };
    let requested = req.instrument_ids.len();
    let scan_id = state.coordinator.trigger_scan(req.instrument_ids);
    info!(scan_id = %scan_id, requested, "scan triggered via API");
    (StatusCode::ACCEPTED, Json(TriggerScanResponse { scan_id })).into_response()
}

async fn scan_result(
    State(state): State<Arc<AppState>>,
    Path(scan_id): Path<String>,
) -> axum::response::Response {
    match state.coordinator.get_scan_result(&scan_id) {
        Some(batch) => Json(batch).into_response(),
        None => error_body(StatusCode::NOT_FOUND, format!("unknown scan '{scan_id}'")),
    }
}

// =============================================================================
// Parameters
// =============================================================================

async fn parameters(State(state): State<Arc<AppState>>) -> axum::response::Response {
    match state.registry.status(None) {
        Ok(params) => Json(params).into_response(),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn parameter(
    State(state): State<Arc<AppState>>,
    Path(parameter_id): Path<String>,
) -> axum::response::Response {
    match state.registry.status(Some(&parameter_id)) {
        Ok(params) => Json(params).into_response(),
        Err(e @ RegistryError::UnknownParameter(_)) => {
            error_body(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// =============================================================================
// Regime
// =============================================================================

async fn regime(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let current = state.regime.current();
    let body = serde_json::json!({
        "active": state.regime.active_label(),
        "label": current.label,
        "confidence": current.confidence(),
        "probabilities": current.probabilities,
        "features": current.features,
        "as_of": current.as_of,
        "unstable": state.regime.is_unstable(),
    });
    Json(body)
}

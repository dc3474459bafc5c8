// =============================================================================
// REST control surface — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. This is the engine's control plane
// for the desktop shell and operations tooling: state snapshot, risk
// controls and the trade journal. CORS is configured permissively for
// development; tighten the allowed origins in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Local;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/pending-orders", get(pending_orders))
        .route("/api/v1/risk", get(risk_state))
        .route("/api/v1/risk/kill", post(engage_kill))
        .route("/api/v1/risk/reset", post(reset_risk))
        .route("/api/v1/risk/portfolio", post(arm_portfolio_sl_tp))
        .route("/api/v1/automations", get(automations))
        .route("/api/v1/trades/today", get(trades_today))
        .route("/api/v1/trades/summary", get(day_summary))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "state_version": state.current_state_version(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.position_manager.get_all_positions())
}

async fn pending_orders(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.position_manager.get_pending_orders())
}

async fn risk_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.risk.snapshot())
}

#[derive(Debug, Deserialize)]
struct KillRequest {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default = "default_exit_positions")]
    exit_open_positions: bool,
}

fn default_exit_positions() -> bool {
    true
}

async fn engage_kill(
    State(state): State<Arc<AppState>>,
    Json(body): Json<KillRequest>,
) -> impl IntoResponse {
    let reason = body.reason.unwrap_or_else(|| "MANUAL_KILL".to_string());
    warn!(reason = %reason, exit = body.exit_open_positions, "kill switch requested via API");
    state
        .engage_kill_switch(&reason, body.exit_open_positions)
        .await;
    Json(state.risk.snapshot())
}

async fn reset_risk(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("risk reset requested via API");
    state.risk.reset_for_new_day();
    Json(state.risk.snapshot())
}

#[derive(Debug, Deserialize)]
struct PortfolioSlTpRequest {
    /// Negative rupee level that flattens the book when total PnL falls to it.
    #[serde(default)]
    stop_loss: f64,
    /// Positive rupee level that flattens the book when total PnL reaches it.
    #[serde(default)]
    target: f64,
    /// Clear both levels instead of arming.
    #[serde(default)]
    clear: bool,
}

async fn arm_portfolio_sl_tp(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PortfolioSlTpRequest>,
) -> impl IntoResponse {
    if body.clear {
        state.position_manager.clear_portfolio_sl_tp();
    } else {
        state
            .position_manager
            .set_portfolio_sl_tp(body.stop_loss, body.target);
    }
    Json(json!({ "ok": true }))
}

async fn automations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.cvd.active_trades())
}

async fn trades_today(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let session_date = Local::now().date_naive().to_string();
    match state.ledger.get_trades_for_date(&session_date) {
        Ok(trades) => Json(trades).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{err:#}") })),
        )
            .into_response(),
    }
}

async fn day_summary(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let session_date = Local::now().date_naive().to_string();
    match state.ledger.get_day_summary(&session_date) {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{err:#}") })),
        )
            .into_response(),
    }
}

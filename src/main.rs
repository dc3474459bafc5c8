// =============================================================================
// Vega Desk — Main Entry Point
// =============================================================================
//
// The engine starts in paper mode unless the settings file says otherwise.
// Market data ingress is owned by the embedding shell: it pushes tick
// batches through `AppState` handles (`paper_broker.update_market_data`,
// `position_manager.update_pnl_from_market_data`, `execution.ingest_tick`)
// and feeds CVD frames to the coordinator. Everything else — heartbeats,
// matching, risk evaluation, reconciliation — runs on its own timer here.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod anomaly;
mod api;
mod app_state;
mod broker;
mod circuit_breaker;
mod cvd;
mod events;
mod execution;
mod journal;
mod ledger;
mod paper;
mod positions;
mod risk;
mod settings;
mod telemetry;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::events::EngineEvent;
use crate::settings::{default_base_dir, Settings};

/// Cadence for persisting the telemetry snapshot.
const TELEMETRY_PERSIST_SECS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║             Vega Desk — Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let settings_path = default_base_dir().join("settings.json");
    let settings = Settings::load(&settings_path).unwrap_or_else(|e| {
        warn!(error = %format!("{e:#}"), "failed to load settings, using defaults");
        Settings::default()
    });

    info!(
        trading_mode = %settings.trading_mode,
        default_symbol = %settings.default_symbol,
        "engine configuration resolved"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = AppState::initialise(settings)?;

    // ── 3. Initial reconciliation ────────────────────────────────────────
    state.position_manager.refresh_from_api().await;
    state.cvd.reconcile_positions().await;

    // ── 4. Execution heartbeat (anomaly surveillance + TCA) ──────────────
    state.execution.start_heartbeat_timer();

    // ── 5. Paper matching loop ───────────────────────────────────────────
    if let Some(paper) = state.paper_broker.clone() {
        tokio::spawn(crate::paper::run_matching_loop(paper));
    }

    // ── 6. Risk lock evaluation loop ─────────────────────────────────────
    let risk_state = state.clone();
    tokio::spawn(async move {
        let secs = risk_state.settings.read().risk_eval_interval_secs.max(1);
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(secs));
        loop {
            interval.tick().await;
            risk_state.evaluate_risk_locks().await;
        }
    });

    // ── 7. Position refresh + automation reconciliation loop ─────────────
    let refresh_state = state.clone();
    tokio::spawn(async move {
        let secs = refresh_state.settings.read().refresh_interval_secs.max(1);
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(secs));
        loop {
            interval.tick().await;
            refresh_state.position_manager.refresh_from_api().await;
            refresh_state.cvd.reconcile_positions().await;
        }
    });

    // ── 8. Event listener: fills → ledger, incidents → containment ───────
    let listener_state = state.clone();
    tokio::spawn(async move {
        let mut rx = listener_state.bus.subscribe();
        loop {
            match rx.recv().await {
                Ok(EngineEvent::OrderUpdate { order }) => {
                    listener_state.execution.record_paper_fill(&order);
                    listener_state.record_closed_trade(&order);
                    listener_state.increment_version();
                }
                Ok(EngineEvent::OrderRejected { reason, tradingsymbol, .. }) => {
                    listener_state.push_error(format!("Order rejected ({tradingsymbol}): {reason}"));
                }
                Ok(EngineEvent::ApiError { message }) => {
                    listener_state.push_error(message);
                }
                Ok(EngineEvent::Incident { incident }) => {
                    // Containment is reserved for critical incidents; medium
                    // and high severities (e.g. a duplicate signal during a
                    // pending-order chase) are surfaced but do not lock the
                    // desk.
                    if incident.severity == crate::anomaly::Severity::Critical {
                        let unwind = incident.playbook.iter().any(|a| a == "unwind_risk");
                        listener_state
                            .engage_kill_switch(&format!("INCIDENT_{}", incident.kind), unwind)
                            .await;
                    } else {
                        listener_state.push_error(format!(
                            "Incident ({}): {}",
                            incident.severity, incident.kind
                        ));
                    }
                }
                Ok(EngineEvent::PortfolioExit { reason, pnl }) => {
                    warn!(reason = %reason, pnl, "portfolio exit — flattening all positions");
                    let symbols: Vec<String> = listener_state
                        .position_manager
                        .get_all_positions()
                        .into_iter()
                        .filter(|p| p.quantity != 0)
                        .map(|p| p.tradingsymbol)
                        .collect();
                    listener_state.position_manager.execute_bulk_exit(symbols).await;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event listener lagged; continuing from live stream");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // ── 9. Telemetry snapshot persistence ────────────────────────────────
    let telemetry_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(TELEMETRY_PERSIST_SECS));
        loop {
            interval.tick().await;
            telemetry_state.execution.dashboard().persist();
        }
    });

    // ── 10. Control API ──────────────────────────────────────────────────
    let bind_addr = state.settings.read().bind_addr.clone();
    let api_state = state.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "control API listening");
                if let Err(err) = axum::serve(listener, app).await {
                    error!(error = %err, "control API server failed");
                }
            }
            Err(err) => error!(addr = %bind_addr, error = %err, "failed to bind control API"),
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    state.execution.stop_heartbeat_timer();
    state.cvd.shutdown();
    state.execution.dashboard().persist();
    if let Err(err) = state.settings.read().save(&settings_path) {
        error!(error = %format!("{err:#}"), "failed to save settings on shutdown");
    }

    info!("Vega Desk shut down complete.");
    Ok(())
}

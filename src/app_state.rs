// =============================================================================
// Central Application State — Vega desk engine
// =============================================================================
//
// The single source of truth tying every subsystem together. Subsystems own
// their interior mutability; AppState holds Arc references and provides the
// unified snapshot for the control API plus the cross-cutting flows that
// need several subsystems at once (kill switch, risk evaluation, ledger
// recording).
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Local;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::anomaly::{HookAlias, Incident, RemediationHooks};
use crate::broker::{BrokerClient, KiteBrokerClient, OrderRecord};
use crate::cvd::CvdCoordinator;
use crate::events::EventBus;
use crate::execution::ExecutionStack;
use crate::journal::utc_now_iso;
use crate::ledger::{TradeLedger, TradeRecord};
use crate::paper::PaperBroker;
use crate::positions::PositionManager;
use crate::risk::{RiskController, RiskLimits};
use crate::settings::Settings;
use crate::types::{OrderStatus, TradingMode, TransactionType};

/// Maximum recent errors retained for the control API.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the operations error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: String,
}

/// Central application state shared across tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version; bumped on every meaningful
    /// mutation so pollers can detect changes cheaply.
    pub state_version: AtomicU64,

    pub trading_mode: TradingMode,
    pub settings: Arc<RwLock<Settings>>,
    pub bus: EventBus,

    pub broker: Arc<dyn BrokerClient>,
    /// Set only in paper mode; drives the 1 Hz matching loop.
    pub paper_broker: Option<Arc<PaperBroker>>,

    pub execution: Arc<ExecutionStack>,
    pub position_manager: Arc<PositionManager>,
    pub risk: Arc<RiskController>,
    pub ledger: Arc<TradeLedger>,
    pub cvd: Arc<CvdCoordinator>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

/// Acknowledges the anomaly responder's playbook actions. Hooks run on the
/// heartbeat task and must not block on broker calls, so the heavyweight
/// reactions (entry lock, flatten) are performed by the incident listener
/// task reacting to the `Incident` event the responder publishes.
struct EngineRemediationHooks;

impl RemediationHooks for EngineRemediationHooks {
    fn dispatch(&self, alias: HookAlias, incident: &Incident) -> Option<anyhow::Result<()>> {
        match alias {
            HookAlias::Pause | HookAlias::Unwind => Some(Ok(())),
            HookAlias::Reroute => {
                warn!(kind = %incident.kind, "reroute requested — single venue, operator action required");
                Some(Ok(()))
            }
        }
    }
}

impl AppState {
    /// Build the full engine from settings. In paper mode the simulator
    /// backs the broker trait; live mode builds the REST client from the
    /// environment.
    pub fn initialise(settings: Settings) -> anyhow::Result<Arc<Self>> {
        let trading_mode = settings.trading_mode;
        let base_dir = settings.resolved_base_dir();
        std::fs::create_dir_all(&base_dir)?;

        let bus = EventBus::new();
        let settings = Arc::new(RwLock::new(settings));

        let (broker, paper_broker): (Arc<dyn BrokerClient>, Option<Arc<PaperBroker>>) =
            match trading_mode {
                TradingMode::Paper => {
                    let starting_balance = settings.read().starting_paper_balance;
                    let paper = Arc::new(PaperBroker::new(starting_balance, &base_dir, bus.clone()));
                    (paper.clone(), Some(paper))
                }
                TradingMode::Live => {
                    let api_key = std::env::var("VEGA_API_KEY").unwrap_or_default();
                    let access_token = std::env::var("VEGA_ACCESS_TOKEN").unwrap_or_default();
                    if api_key.is_empty() || access_token.is_empty() {
                        anyhow::bail!(
                            "live mode needs VEGA_API_KEY and VEGA_ACCESS_TOKEN in the environment"
                        );
                    }
                    (Arc::new(KiteBrokerClient::new(api_key, access_token)), None)
                }
            };

        let risk = Arc::new(RiskController::new(RiskLimits::from_settings(
            &settings.read(),
        )));
        let execution = Arc::new(ExecutionStack::new(
            trading_mode,
            &base_dir,
            Arc::new(EngineRemediationHooks),
            bus.clone(),
        ));
        let position_manager = Arc::new(PositionManager::new(
            broker.clone(),
            trading_mode,
            bus.clone(),
        ));
        let ledger = Arc::new(TradeLedger::new(trading_mode, &base_dir)?);
        let cvd = Arc::new(CvdCoordinator::new(
            trading_mode,
            &base_dir,
            position_manager.clone(),
            execution.clone(),
            broker.clone(),
            risk.clone(),
            settings.clone(),
            bus.clone(),
        ));
        cvd.load_state();

        info!(mode = %trading_mode, base_dir = %base_dir.display(), "engine state initialised");

        Ok(Arc::new(Self {
            state_version: AtomicU64::new(1),
            trading_mode,
            settings,
            bus,
            broker,
            paper_broker,
            execution,
            position_manager,
            risk,
            ledger,
            cvd,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }))
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error log ───────────────────────────────────────────────────────

    pub fn push_error(&self, message: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            at: utc_now_iso(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);
        self.increment_version();
    }

    // ── Kill switch orchestration ───────────────────────────────────────

    /// Engage the global kill switch: lock entries, disable and clear every
    /// CVD automation, optionally flatten the book. Idempotent.
    pub async fn engage_kill_switch(&self, reason: &str, exit_open_positions: bool) {
        if !self.risk.activate_kill_switch(reason) {
            return;
        }

        self.cvd.disable_all_and_clear();

        if exit_open_positions {
            let symbols: Vec<String> = self
                .position_manager
                .get_all_positions()
                .into_iter()
                .filter(|p| p.quantity != 0)
                .map(|p| p.tradingsymbol)
                .collect();
            if !symbols.is_empty() {
                warn!(count = symbols.len(), reason, "kill switch flattening open positions");
                self.position_manager.execute_bulk_exit(symbols).await;
            }
        }

        self.push_error(format!("Global kill switch activated: {reason}"));
    }

    /// One pass of the drawdown monitor: realised PnL from today's ledger
    /// plus unrealised from the position book.
    pub async fn evaluate_risk_locks(&self) {
        let session_date = Local::now().date_naive().to_string();
        let realized = match self.ledger.get_realized_pnl_for_date(&session_date) {
            Ok(pnl) => pnl,
            Err(err) => {
                error!(error = %format!("{err:#}"), "could not read realised pnl; skipping risk pass");
                return;
            }
        };
        let unrealized = self.position_manager.get_total_pnl();

        if let Some(reason) = self.risk.evaluate_risk_locks(realized, unrealized) {
            self.engage_kill_switch(&reason, true).await;
        }
    }

    // ── Ledger recording ────────────────────────────────────────────────

    /// Fold a completed order event into the trade ledger. Only fills that
    /// closed quantity produce a row; the entry price is recovered from the
    /// fill price and the realised PnL the simulator attached.
    pub fn record_closed_trade(&self, order: &OrderRecord) {
        if order.status != OrderStatus::Complete || order.exit_qty <= 0 {
            return;
        }

        let exit_price = order.average_price;
        let qty = order.exit_qty;
        // A SELL that closes quantity was exiting a LONG, and vice versa.
        let side = match order.transaction_type {
            TransactionType::Sell => "LONG",
            TransactionType::Buy => "SHORT",
        };
        let entry_price = if qty > 0 {
            match order.transaction_type {
                TransactionType::Sell => exit_price - order.realized_pnl / qty as f64,
                TransactionType::Buy => exit_price + order.realized_pnl / qty as f64,
            }
        } else {
            exit_price
        };
        let is_auto = order
            .group_name
            .as_deref()
            .map(|g| g.starts_with("CVD_AUTO_"))
            .unwrap_or(false);

        let record = TradeRecord {
            trade_id: Uuid::new_v4().to_string(),
            order_id_entry: None,
            order_id_exit: order.order_id.clone(),
            symbol: order.tradingsymbol.clone(),
            tradingsymbol: order.tradingsymbol.clone(),
            instrument_token: 0,
            option_type: option_type_from_symbol(&order.tradingsymbol),
            expiry: crate::paper::parse_expiry_from_symbol(&order.tradingsymbol)
                .map(|d| d.to_string()),
            strike: 0.0,
            side: side.to_string(),
            quantity: qty,
            entry_price,
            exit_price,
            entry_time: String::new(),
            exit_time: order
                .exchange_timestamp
                .clone()
                .unwrap_or_else(utc_now_iso),
            realized_pnl: order.realized_pnl,
            charges: 0.0,
            net_pnl: order.realized_pnl,
            exit_reason: None,
            strategy_tag: order.group_name.clone(),
            trade_status: if is_auto { "ALGO" } else { "MANUAL" }.to_string(),
            strategy_name: String::new(),
            trading_mode: String::new(),
            session_date: Local::now().date_naive().to_string(),
        };

        match self.ledger.record_trade(&record) {
            Ok(true) => self.record_exit_outcome(&order.tradingsymbol, order.realized_pnl),
            Ok(false) => {} // duplicate replay, already recorded
            Err(err) => error!(error = %format!("{err:#}"), "failed to record closed trade"),
        }
    }

    fn record_exit_outcome(&self, tradingsymbol: &str, pnl: f64) {
        let outcome = if pnl >= 0.0 { "win" } else { "loss" };
        self.execution.record_exit(tradingsymbol, outcome, pnl);
        self.increment_version();
    }

    // ── Snapshot for the control API ────────────────────────────────────

    pub fn build_snapshot(&self) -> Value {
        let positions = self.position_manager.get_all_positions();
        let pending = self.position_manager.get_pending_orders();
        let total_pnl = self.position_manager.get_total_pnl();

        let paper_account = self.paper_broker.as_ref().map(|paper| {
            json!({
                "balance": paper.balance(),
                "used_margin": paper.used_margin(),
                "available_margin": paper.available_margin(),
            })
        });

        json!({
            "state_version": self.current_state_version(),
            "server_time": chrono::Utc::now().timestamp_millis(),
            "trading_mode": self.trading_mode,
            "uptime_seconds": self.start_time.elapsed().as_secs(),
            "last_refresh": self.position_manager.last_refresh_time(),
            "positions": positions,
            "pending_orders": pending,
            "total_unrealized_pnl": total_pnl,
            "risk": self.risk.snapshot(),
            "active_automations": self.cvd.active_trades().len(),
            "paper_account": paper_account,
            "recent_errors": *self.recent_errors.read(),
            "telemetry": self.execution.dashboard().snapshot(),
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("trading_mode", &self.trading_mode)
            .field("state_version", &self.current_state_version())
            .finish()
    }
}

fn option_type_from_symbol(tradingsymbol: &str) -> String {
    if tradingsymbol.ends_with("CE") {
        "CE".to_string()
    } else if tradingsymbol.ends_with("PE") {
        "PE".to_string()
    } else if tradingsymbol.ends_with("FUT") {
        "FUT".to_string()
    } else {
        "EQ".to_string()
    }
}

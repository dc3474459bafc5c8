// =============================================================================
// Risk Controller (RMS) — pre-trade gate + intraday drawdown kill switch
// =============================================================================
//
// Two layers of protection:
//
//   1. Pre-trade gate: BUY orders are refused when the kill switch is
//      active, when a new symbol would exceed the open-position cap, or
//      when the order would push gross open quantity past its cap.
//   2. Drawdown monitor: realised (ledger) + unrealised (positions) PnL is
//      tracked against an upward-ratcheting intraday peak; breaching the
//      absolute-loss or peak-drawdown limit engages the kill switch.
//
// Limits follow the "0 means disabled" convention. The kill switch itself
// only sets flags here; unwinding (disable automations, bulk exit) is
// orchestrated by the engine so this module stays dependency-free.
//
// All counters reset at the first evaluation of a new trading day.
// =============================================================================

use chrono::{Local, NaiveDate};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::settings::Settings;
use crate::types::{Position, TransactionType};

/// Rupee/count limits; 0 disables the corresponding check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskLimits {
    pub intraday_drawdown_limit: f64,
    pub max_portfolio_loss: f64,
    pub max_open_positions: i64,
    pub max_gross_open_quantity: i64,
}

impl RiskLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            intraday_drawdown_limit: settings.risk_intraday_drawdown_limit.max(0.0),
            max_portfolio_loss: settings.risk_max_portfolio_loss.max(0.0),
            max_open_positions: settings.risk_max_open_positions.max(0),
            max_gross_open_quantity: settings.risk_max_gross_open_quantity.max(0),
        }
    }
}

/// Reason codes for kill-switch activation.
pub const REASON_MAX_PORTFOLIO_LOSS: &str = "MAX_PORTFOLIO_LOSS";
pub const REASON_INTRADAY_DRAWDOWN_LOCK: &str = "INTRADAY_DRAWDOWN_LOCK";

struct Inner {
    kill_switch_active: bool,
    kill_switch_reason: String,
    drawdown_lock_active: bool,
    intraday_peak_pnl: f64,
    current_date: NaiveDate,
}

pub struct RiskController {
    limits: RwLock<RiskLimits>,
    inner: RwLock<Inner>,
}

impl RiskController {
    pub fn new(limits: RiskLimits) -> Self {
        info!(?limits, "risk controller initialised");
        Self {
            limits: RwLock::new(limits),
            inner: RwLock::new(Inner {
                kill_switch_active: false,
                kill_switch_reason: String::new(),
                drawdown_lock_active: false,
                intraday_peak_pnl: 0.0,
                current_date: Local::now().date_naive(),
            }),
        }
    }

    pub fn reload_limits_from_settings(&self, settings: &Settings) {
        let limits = RiskLimits::from_settings(settings);
        info!(?limits, "risk limits reloaded");
        *self.limits.write() = limits;
    }

    pub fn limits(&self) -> RiskLimits {
        self.limits.read().clone()
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate
    // -------------------------------------------------------------------------

    /// Gate a prospective order. Only BUY entries are gated — exits must
    /// always be allowed through.
    ///
    /// Returns `(true, "")` when clear, `(false, reason)` otherwise.
    pub fn validate_pre_trade_risk(
        &self,
        transaction_type: TransactionType,
        quantity: i64,
        tradingsymbol: Option<&str>,
        open_positions: &[Position],
    ) -> (bool, String) {
        self.maybe_reset_daily();

        if transaction_type != TransactionType::Buy {
            return (true, String::new());
        }

        let limits = self.limits.read().clone();
        let inner = self.inner.read();

        if inner.kill_switch_active {
            let reason = if inner.kill_switch_reason.is_empty() {
                "risk lock".to_string()
            } else {
                inner.kill_switch_reason.clone()
            };
            return (false, format!("Global kill switch is active ({reason})."));
        }

        if limits.max_open_positions > 0 {
            let active_symbols: std::collections::HashSet<&str> = open_positions
                .iter()
                .filter(|p| p.quantity != 0)
                .map(|p| p.tradingsymbol.as_str())
                .collect();
            let is_new_symbol = tradingsymbol
                .map(|s| !active_symbols.contains(s))
                .unwrap_or(true);
            if is_new_symbol && active_symbols.len() as i64 >= limits.max_open_positions {
                return (
                    false,
                    format!("Max open positions limit reached ({}).", limits.max_open_positions),
                );
            }
        }

        if limits.max_gross_open_quantity > 0 {
            let current_gross: i64 = open_positions.iter().map(|p| p.quantity.abs()).sum();
            if current_gross + quantity.abs() > limits.max_gross_open_quantity {
                return (
                    false,
                    format!(
                        "Gross quantity limit breached ({}). Current {current_gross}, requested +{}.",
                        limits.max_gross_open_quantity,
                        quantity.abs()
                    ),
                );
            }
        }

        (true, String::new())
    }

    // -------------------------------------------------------------------------
    // Drawdown monitor
    // -------------------------------------------------------------------------

    /// Evaluate the intraday loss locks against today's realised and the
    /// current unrealised PnL. When a limit trips, the kill switch engages
    /// and the activation reason is returned exactly once — subsequent calls
    /// in the same day are no-ops.
    pub fn evaluate_risk_locks(&self, realized_pnl: f64, unrealized_pnl: f64) -> Option<String> {
        self.maybe_reset_daily();

        let total_intraday_pnl = realized_pnl + unrealized_pnl;
        let limits = self.limits.read().clone();

        {
            let mut inner = self.inner.write();
            if total_intraday_pnl > inner.intraday_peak_pnl {
                inner.intraday_peak_pnl = total_intraday_pnl;
            }
        }

        if limits.max_portfolio_loss > 0.0 && total_intraday_pnl <= -limits.max_portfolio_loss {
            return self
                .activate_kill_switch(REASON_MAX_PORTFOLIO_LOSS)
                .then(|| REASON_MAX_PORTFOLIO_LOSS.to_string());
        }

        if limits.intraday_drawdown_limit > 0.0 {
            let peak = self.inner.read().intraday_peak_pnl;
            let drawdown = peak - total_intraday_pnl;
            if drawdown >= limits.intraday_drawdown_limit {
                return self
                    .activate_kill_switch(REASON_INTRADAY_DRAWDOWN_LOCK)
                    .then(|| REASON_INTRADAY_DRAWDOWN_LOCK.to_string());
            }
        }

        None
    }

    /// Engage the kill switch. Returns true only on the transition — callers
    /// run the unwind playbook (disable automations, bulk exit) exactly once.
    pub fn activate_kill_switch(&self, reason: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.kill_switch_active {
            return false;
        }
        inner.kill_switch_active = true;
        inner.kill_switch_reason = reason.to_string();
        inner.drawdown_lock_active = true;
        warn!(reason, "GLOBAL KILL SWITCH ACTIVATED");
        true
    }

    /// New trading day: clear locks and reset the peak.
    pub fn reset_for_new_day(&self) {
        let mut inner = self.inner.write();
        Self::do_reset(&mut inner, Local::now().date_naive());
        info!("risk locks reset for new trading day");
    }

    fn maybe_reset_daily(&self) {
        let today = Local::now().date_naive();
        {
            let inner = self.inner.read();
            if inner.current_date == today {
                return;
            }
        }
        let mut inner = self.inner.write();
        // Double-check after taking the write lock.
        if inner.current_date != today {
            info!(
                old_date = %inner.current_date,
                new_date = %today,
                "date rolled — resetting risk locks"
            );
            Self::do_reset(&mut inner, today);
        }
    }

    fn do_reset(inner: &mut Inner, date: NaiveDate) {
        inner.kill_switch_active = false;
        inner.kill_switch_reason.clear();
        inner.drawdown_lock_active = false;
        inner.intraday_peak_pnl = 0.0;
        inner.current_date = date;
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn kill_switch_active(&self) -> bool {
        self.inner.read().kill_switch_active
    }

    pub fn kill_switch_reason(&self) -> String {
        self.inner.read().kill_switch_reason.clone()
    }

    pub fn intraday_peak_pnl(&self) -> f64 {
        self.inner.read().intraday_peak_pnl
    }

    pub fn snapshot(&self) -> Value {
        let inner = self.inner.read();
        let limits = self.limits.read();
        json!({
            "kill_switch_active": inner.kill_switch_active,
            "kill_switch_reason": inner.kill_switch_reason,
            "drawdown_lock_active": inner.drawdown_lock_active,
            "intraday_peak_pnl": inner.intraday_peak_pnl,
            "current_date": inner.current_date.to_string(),
            "limits": *limits,
        })
    }
}

impl std::fmt::Debug for RiskController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("RiskController")
            .field("kill_switch_active", &inner.kill_switch_active)
            .field("intraday_peak_pnl", &inner.intraday_peak_pnl)
            .finish()
    }
}

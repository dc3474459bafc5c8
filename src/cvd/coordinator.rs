// =============================================================================
// CVD Automation Coordinator — per-instrument signal/state machine
// =============================================================================
//
// Owns the lifecycle of single-chart CVD automations: entry signals open ATM
// option positions, per-bar market-state frames drive trailing stops and
// exits, and every mutation persists so a restart resumes mid-trade.
//
// Hard rules enforced here:
//   - nothing enters at or after the 15:00 local cutoff; reaching it force-
//     exits everything with reason AUTO_3PM_CUTOFF;
//   - a same-side signal stacks only after 15 minutes;
//   - an opposite-side signal must carry STRICTLY higher strategy priority
//     to reverse, and the reversal exits with reason AUTO_REVERSE;
//   - trailing behaviour is locked to the strategy recorded at entry.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::broker::{BrokerClient, BrokerOrderArgs};
use crate::events::{EngineEvent, EventBus};
use crate::execution::{ExecutionRequest, ExecutionStack};
use crate::positions::PositionManager;
use crate::risk::RiskController;
use crate::settings::Settings;
use crate::types::{Contract, OrderType, TradingMode, TransactionType};

use super::retry::PendingRetryTimers;
use super::state::{
    default_giveback_strategies, AutomationTrade, CvdSignal, CvdStateStore, MarketStateFrame,
    Route, SignalSide, StrategyType, DEFAULT_ATR_TRAILING_STEP_POINTS, DEFAULT_STOPLOSS_POINTS,
};

/// Local time at and after which no automation entry is accepted.
fn cutoff_time() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 0, 0).expect("valid cutoff time")
}

/// Minimum gap between same-side signals (stacking rule).
const STACKING_MINUTES: f64 = 15.0;

/// Pending-entry retry cap per token.
pub(super) const MAX_PENDING_RETRY_ATTEMPTS: u32 = 6;

/// open_drive entries only chase fills for this long after the signal.
const OPEN_DRIVE_RETRY_WINDOW_MINUTES: i64 = 3;

pub const REASON_CUTOFF: &str = "AUTO_3PM_CUTOFF";
pub const REASON_REVERSE: &str = "AUTO_REVERSE";
pub const REASON_SL: &str = "AUTO_SL";
pub const REASON_GIVEBACK: &str = "AUTO_MAX_PROFIT_GIVEBACK";
pub const REASON_EMA10_CROSS: &str = "AUTO_EMA10_CROSS";
pub const REASON_EMA51_CROSS: &str = "AUTO_EMA51_CROSS";
pub const REASON_BREAKOUT_EXIT: &str = "AUTO_BREAKOUT_EXIT";
pub const REASON_ATR_REVERSAL_EXIT: &str = "AUTO_ATR_REVERSAL_EXIT";

// ---------------------------------------------------------------------------
// Strike ladder snapshot
// ---------------------------------------------------------------------------

/// One strike row with its option contracts.
#[derive(Debug, Clone, Default)]
pub struct StrikeRung {
    pub strike: f64,
    pub call: Option<Contract>,
    pub put: Option<Contract>,
}

/// Read-only snapshot of the strike ladder, refreshed by the market-data
/// side. `selected_strikes` mirrors the multi-strike panel's selection.
#[derive(Debug, Clone, Default)]
pub struct StrikeLadderSnapshot {
    pub atm_strike: Option<f64>,
    pub rungs: Vec<StrikeRung>,
    pub selected_strikes: Vec<f64>,
}

impl StrikeLadderSnapshot {
    fn rung_at(&self, strike: f64) -> Option<&StrikeRung> {
        self.rungs.iter().find(|r| (r.strike - strike).abs() < 1e-6)
    }

    /// ATM contract for an entry side: longs buy calls, shorts buy puts.
    pub fn atm_contract(&self, side: SignalSide) -> Option<Contract> {
        let rung = self.rung_at(self.atm_strike?)?;
        match side {
            SignalSide::Long => rung.call.clone(),
            SignalSide::Short => rung.put.clone(),
        }
    }

    /// Contracts backing a panel (multi-strike) entry. Falls back to just
    /// the ATM contract when no explicit selection exists.
    pub fn panel_contracts(&self, side: SignalSide) -> Vec<Contract> {
        let picker = |rung: &StrikeRung| match side {
            SignalSide::Long => rung.call.clone(),
            SignalSide::Short => rung.put.clone(),
        };

        let selected: Vec<Contract> = self
            .selected_strikes
            .iter()
            .filter_map(|s| self.rung_at(*s))
            .filter_map(picker)
            .collect();

        if selected.is_empty() {
            self.atm_contract(side).into_iter().collect()
        } else {
            selected
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct CvdCoordinator {
    trading_mode: TradingMode,
    positions: RwLock<HashMap<u32, AutomationTrade>>,
    market_state: RwLock<HashMap<u32, MarketStateFrame>>,
    ladder: RwLock<StrikeLadderSnapshot>,
    store: CvdStateStore,
    position_manager: Arc<PositionManager>,
    execution: Arc<ExecutionStack>,
    broker: Arc<dyn BrokerClient>,
    risk: Arc<RiskController>,
    settings: Arc<RwLock<Settings>>,
    bus: EventBus,
    pub(super) retry_timers: PendingRetryTimers,
    /// Injected so the 15:00 cutoff is testable at any wall-clock time.
    local_time: fn() -> NaiveTime,
}

fn wall_clock_time() -> NaiveTime {
    Local::now().time()
}

impl CvdCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trading_mode: TradingMode,
        base_dir: &std::path::Path,
        position_manager: Arc<PositionManager>,
        execution: Arc<ExecutionStack>,
        broker: Arc<dyn BrokerClient>,
        risk: Arc<RiskController>,
        settings: Arc<RwLock<Settings>>,
        bus: EventBus,
    ) -> Self {
        Self {
            trading_mode,
            positions: RwLock::new(HashMap::new()),
            market_state: RwLock::new(HashMap::new()),
            ladder: RwLock::new(StrikeLadderSnapshot::default()),
            store: CvdStateStore::new(trading_mode, base_dir),
            position_manager,
            execution,
            broker,
            risk,
            settings,
            bus,
            retry_timers: PendingRetryTimers::new(),
            local_time: wall_clock_time,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_clock(&mut self, clock: fn() -> NaiveTime) {
        self.local_time = clock;
    }

    /// Resume automations persisted by a previous run.
    pub fn load_state(&self) {
        let loaded = self.store.load();
        if !loaded.is_empty() {
            *self.positions.write() = loaded;
        }
    }

    pub fn update_ladder(&self, snapshot: StrikeLadderSnapshot) {
        *self.ladder.write() = snapshot;
    }

    pub fn active_trades(&self) -> HashMap<u32, AutomationTrade> {
        self.positions.read().clone()
    }

    pub fn active_trade(&self, token: u32) -> Option<AutomationTrade> {
        self.positions.read().get(&token).cloned()
    }

    /// Kill-switch hook: disable every enabled chart and drop all active
    /// automations.
    pub fn disable_all_and_clear(&self) {
        for state in self.market_state.write().values_mut() {
            state.enabled = false;
        }
        let tokens: Vec<u32> = self.positions.read().keys().copied().collect();
        for token in &tokens {
            self.retry_timers.stop(*token);
        }
        self.positions.write().clear();
        self.persist();
        warn!("all CVD automations disabled and cleared");
    }

    fn persist(&self) {
        self.store.save(&self.positions.read());
    }

    /// Tear down every retry timer and flush state (engine shutdown).
    pub fn shutdown(&self) {
        self.retry_timers.stop_all();
        self.persist();
    }

    pub fn is_cutoff_reached(&self) -> bool {
        (self.local_time)() >= cutoff_time()
    }

    // -------------------------------------------------------------------------
    // Signal handling (entries and reversals)
    // -------------------------------------------------------------------------

    pub async fn handle_signal(self: &Arc<Self>, payload: CvdSignal) {
        let token = payload.instrument_token;

        if self.is_cutoff_reached() {
            self.enforce_cutoff_exit(REASON_CUTOFF).await;
            info!("ignoring CVD signal after the 15:00 cutoff");
            return;
        }

        let state = self.market_state.read().get(&token).cloned();
        let enabled = state.as_ref().map(|s| s.enabled).unwrap_or(false);
        if !enabled {
            return;
        }

        let Some(signal_side) = payload.signal_side else {
            return;
        };

        let route = payload
            .route
            .or_else(|| state.as_ref().and_then(|s| s.route))
            .unwrap_or_default();

        // Stacking / reversal arbitration against any active trade.
        if let Some(active) = self.active_trade(token) {
            if active.signal_side == signal_side {
                let elapsed_minutes = minutes_between(
                    active.signal_timestamp.as_deref(),
                    payload.timestamp.as_deref(),
                );
                if elapsed_minutes < STACKING_MINUTES {
                    info!(
                        token,
                        elapsed_minutes,
                        "skipping same-side signal — stacking needs 15+ minutes"
                    );
                    return;
                }
            } else {
                let incoming = StrategyType::from_signal_type(
                    payload
                        .signal_type
                        .as_deref()
                        .or_else(|| state.as_ref().and_then(|s| s.signal_filter.as_deref())),
                );
                if incoming.priority() <= active.strategy_type.priority() {
                    info!(
                        token,
                        active = %active.strategy_type,
                        incoming = %incoming,
                        "ignoring opposite lower-priority signal"
                    );
                    return;
                }

                for symbol in active.tracked_symbols() {
                    self.exit_position_automated(&symbol, REASON_REVERSE).await;
                }
                if self.positions.write().remove(&token).is_some() {
                    self.persist();
                }
            }
        }

        let Some(contract) = self.ladder.read().atm_contract(signal_side) else {
            warn!(token, side = %signal_side, "ATM contract unavailable for signal");
            return;
        };

        let (lots, product) = {
            let settings = self.settings.read();
            (settings.default_lots.max(1), settings.default_product)
        };
        let quantity = (contract.lot_size * lots).max(1);

        let stoploss_points = payload
            .stoploss_points
            .or_else(|| state.as_ref().and_then(|s| s.stoploss_points))
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(DEFAULT_STOPLOSS_POINTS);
        let giveback_points = payload
            .max_profit_giveback_points
            .or_else(|| state.as_ref().and_then(|s| s.max_profit_giveback_points))
            .filter(|v| v.is_finite())
            .unwrap_or(0.0);
        let giveback_strategies = payload
            .max_profit_giveback_strategies
            .clone()
            .or_else(|| {
                state
                    .as_ref()
                    .and_then(|s| s.max_profit_giveback_strategies.clone())
            })
            .unwrap_or_else(default_giveback_strategies);

        let entry_underlying = payload
            .price_close
            .or_else(|| state.as_ref().map(|s| s.price_close))
            .filter(|v| v.is_finite())
            .unwrap_or(0.0);
        let strategy_type = StrategyType::from_signal_type(
            payload
                .signal_type
                .as_deref()
                .or_else(|| state.as_ref().and_then(|s| s.signal_filter.as_deref())),
        );

        if contract.ltp <= 0.0 || entry_underlying <= 0.0 {
            return;
        }

        let sl_underlying = match signal_side {
            SignalSide::Long => entry_underlying - stoploss_points,
            SignalSide::Short => entry_underlying + stoploss_points,
        };

        let panel_contracts = if route == Route::BuyExitPanel {
            self.ladder.read().panel_contracts(signal_side)
        } else {
            vec![contract.clone()]
        };
        let all_tradingsymbols: Vec<String> = panel_contracts
            .iter()
            .map(|c| c.tradingsymbol.clone())
            .collect();
        let tracked_tradingsymbol = all_tradingsymbols
            .first()
            .cloned()
            .unwrap_or_else(|| contract.tradingsymbol.clone());

        let group_name = format!("CVD_AUTO_{token}");
        let trade = AutomationTrade {
            tradingsymbol: tracked_tradingsymbol.clone(),
            tradingsymbols: all_tradingsymbols,
            signal_side,
            route,
            signal_timestamp: payload.timestamp.clone(),
            strategy_type,
            stoploss_points,
            max_profit_giveback_points: giveback_points,
            max_profit_giveback_strategies: giveback_strategies,
            atr_trailing_step_points: DEFAULT_ATR_TRAILING_STEP_POINTS,
            entry_underlying,
            max_favorable_points: 0.0,
            sl_underlying: Some(sl_underlying),
            last_price_close: Some(entry_underlying),
            last_ema10: state.as_ref().map(|s| s.ema10),
            last_ema51: state.as_ref().map(|s| s.ema51),
            last_cvd_close: state.as_ref().map(|s| s.cvd_close),
            last_cvd_ema10: state.as_ref().map(|s| s.cvd_ema10),
            last_cvd_ema51: state.as_ref().map(|s| s.cvd_ema51),
            quantity,
            product,
            transaction_type: TransactionType::Buy,
            group_name: group_name.clone(),
            pending_retry_attempts: 0,
            pending_retry_disabled: false,
            extra: serde_json::Map::new(),
        };

        self.positions.write().insert(token, trade);
        self.persist();
        self.bus.publish(EngineEvent::CvdSignal {
            signal: payload.clone(),
        });

        info!(
            token,
            side = %signal_side,
            strategy = %strategy_type,
            tradingsymbol = %tracked_tradingsymbol,
            quantity,
            entry_underlying,
            sl_underlying,
            "CVD automation entry"
        );

        for entry_contract in &panel_contracts {
            self.execute_entry_order(entry_contract, quantity, product, token, &group_name, route)
                .await;
        }

        // Give the broker a moment, then verify the entry actually landed.
        let coordinator = Arc::clone(self);
        let signal_ts = payload.timestamp.clone();
        let symbol = tracked_tradingsymbol.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            coordinator
                .reconcile_failed_entry(token, &symbol, signal_ts.as_deref())
                .await;
        });
    }

    /// Route one entry order through the risk gate and the execution stack.
    async fn execute_entry_order(
        self: &Arc<Self>,
        contract: &Contract,
        quantity: i64,
        product: crate::types::ProductType,
        token: u32,
        group_name: &str,
        route: Route,
    ) {
        let open_positions = self.position_manager.get_all_positions();
        let (ok, reason) = self.risk.validate_pre_trade_risk(
            TransactionType::Buy,
            quantity,
            Some(&contract.tradingsymbol),
            &open_positions,
        );
        if !ok {
            warn!(tradingsymbol = %contract.tradingsymbol, reason = %reason, "automation order blocked by risk control");
            self.bus.publish(EngineEvent::OrderRejected {
                reason,
                tradingsymbol: contract.tradingsymbol.clone(),
                quantity,
            });
            return;
        }

        self.position_manager
            .set_group_name_hint(&contract.tradingsymbol, Some(group_name));

        let mut request = ExecutionRequest::new(
            contract.tradingsymbol.clone(),
            TransactionType::Buy,
            quantity,
            OrderType::Market,
            product,
            contract.ltp,
        );
        request.bid = contract.bid;
        request.ask = contract.ask;
        request.metadata.insert(
            "source".to_string(),
            serde_json::json!(match route {
                Route::BuyExitPanel => "buy_exit_panel",
                Route::SingleStrike => "single_strike",
            }),
        );
        request
            .metadata
            .insert("auto_token".to_string(), serde_json::json!(token));
        request
            .metadata
            .insert("group_name".to_string(), serde_json::json!(group_name));

        let args = BrokerOrderArgs {
            exchange: crate::types::Exchange::Nfo,
            tradingsymbol: contract.tradingsymbol.clone(),
            transaction_type: TransactionType::Buy,
            quantity,
            product,
            order_type: OrderType::Market,
            price: None,
            trigger_price: None,
            group_name: Some(group_name.to_string()),
        };

        match self.execution.execute(&request, self.broker.as_ref(), &args).await {
            Ok(order_ids) => {
                info!(
                    tradingsymbol = %contract.tradingsymbol,
                    children = order_ids.len(),
                    "automation entry order(s) placed"
                );
            }
            Err(err) => {
                warn!(
                    tradingsymbol = %contract.tradingsymbol,
                    error = %err,
                    placed = err.placed_order_ids().len(),
                    "automation entry failed"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Per-bar market state
    // -------------------------------------------------------------------------

    pub async fn handle_market_state(self: &Arc<Self>, frame: MarketStateFrame) {
        let token = frame.instrument_token;
        self.market_state.write().insert(token, frame.clone());
        self.bus
            .publish(EngineEvent::CvdMarketState { frame: frame.clone() });

        if self.is_cutoff_reached() {
            self.enforce_cutoff_exit(REASON_CUTOFF).await;
            return;
        }

        let Some(trade) = self.active_trade(token) else {
            return;
        };

        // A trade with no live position is either waiting on a pending
        // order (retry loop) or dead (drop it).
        let tracked = trade.tracked_symbols();
        let live: Vec<crate::types::Position> = tracked
            .iter()
            .filter_map(|s| self.position_manager.get_position(s))
            .collect();
        if live.is_empty() {
            let first = tracked.first().cloned().unwrap_or_default();
            if !first.is_empty() && self.position_manager.has_pending_order_for(&first) {
                self.start_pending_retry(token);
                return;
            }
            // Neither a live position nor a working order: the trade is dead.
            self.retry_timers.stop(token);
            if self.positions.write().remove(&token).is_some() {
                self.persist();
            }
            return;
        }
        self.retry_timers.stop(token);

        let price_close = finite_or(frame.price_close, 0.0);
        if price_close <= 0.0 {
            return;
        }
        let ema10 = finite_or(frame.ema10, 0.0);
        let ema51 = finite_or(frame.ema51, 0.0);
        let cvd_close = finite_or(frame.cvd_close, 0.0);
        let cvd_ema10 = finite_or(frame.cvd_ema10, 0.0);
        let cvd_ema51 = finite_or(frame.cvd_ema51, 0.0);

        let side = trade.signal_side;
        let strategy = trade.strategy_type;
        let entry = finite_or(trade.entry_underlying, 0.0);
        let stoploss_points = finite_or(trade.stoploss_points, 0.0);
        let step = finite_or(trade.atr_trailing_step_points, DEFAULT_ATR_TRAILING_STEP_POINTS);

        // Favourable excursion, signed by side, ratcheted.
        let favorable_move = if entry > 0.0 {
            let raw = match side {
                SignalSide::Long => price_close - entry,
                SignalSide::Short => entry - price_close,
            };
            finite_or(raw, 0.0)
        } else {
            0.0
        };
        let max_favorable = trade.max_favorable_points.max(favorable_move);

        // Trailing stop: tighten-only, stepped by the entry strategy.
        let mut sl_underlying = trade.sl_underlying;
        if stoploss_points > 0.0 && entry > 0.0 {
            let trail_offset = match strategy {
                StrategyType::AtrReversal if step > 0.0 => {
                    let steps = (favorable_move.max(0.0) / step).floor();
                    steps * step
                }
                StrategyType::EmaCross | StrategyType::RangeBreakout
                    if favorable_move >= 200.0 =>
                {
                    (1.0 + ((favorable_move - 200.0) / 100.0).floor()) * 100.0
                }
                _ => 0.0,
            };
            if trail_offset > 0.0 {
                let candidate = match side {
                    SignalSide::Long => entry - stoploss_points + trail_offset,
                    SignalSide::Short => entry + stoploss_points - trail_offset,
                };
                sl_underlying = Some(match (sl_underlying, side) {
                    (Some(current), SignalSide::Long) => current.max(candidate),
                    (Some(current), SignalSide::Short) => current.min(candidate),
                    (None, _) => candidate,
                });
            }
        }

        let hit_stop = match (sl_underlying, side) {
            (Some(sl), SignalSide::Long) => price_close <= sl,
            (Some(sl), SignalSide::Short) => price_close >= sl,
            (None, _) => false,
        };

        // Cross detection against the previous bar's memory.
        let prev_price = trade.last_price_close;
        let prev_ema10 = trade.last_ema10;
        let prev_ema51 = trade.last_ema51;
        let prev_cvd = trade.last_cvd_close;
        let prev_cvd_ema10 = trade.last_cvd_ema10;
        let prev_cvd_ema51 = trade.last_cvd_ema51;

        let cross_above = |prev_v: Option<f64>, prev_ref: Option<f64>, v: f64, r: f64| {
            matches!((prev_v, prev_ref), (Some(pv), Some(pr)) if pv <= pr && v > r)
        };
        let cross_below = |prev_v: Option<f64>, prev_ref: Option<f64>, v: f64, r: f64| {
            matches!((prev_v, prev_ref), (Some(pv), Some(pr)) if pv >= pr && v < r)
        };

        let price_above_ema51 = ema51 > 0.0 && cross_above(prev_price, prev_ema51, price_close, ema51);
        let price_below_ema51 = ema51 > 0.0 && cross_below(prev_price, prev_ema51, price_close, ema51);
        let price_above_ema10 = ema10 > 0.0 && cross_above(prev_price, prev_ema10, price_close, ema10);
        let price_below_ema10 = ema10 > 0.0 && cross_below(prev_price, prev_ema10, price_close, ema10);
        let cvd_above_ema10 = cvd_ema10 != 0.0 && cross_above(prev_cvd, prev_cvd_ema10, cvd_close, cvd_ema10);
        let cvd_below_ema10 = cvd_ema10 != 0.0 && cross_below(prev_cvd, prev_cvd_ema10, cvd_close, cvd_ema10);
        let cvd_above_ema51 = cvd_ema51 != 0.0 && cross_above(prev_cvd, prev_cvd_ema51, cvd_close, cvd_ema51);
        let cvd_below_ema51 = cvd_ema51 != 0.0 && cross_below(prev_cvd, prev_cvd_ema51, cvd_close, cvd_ema51);

        let giveback_applies = trade.giveback_applies();
        let exit_reason = if hit_stop {
            Some(REASON_SL)
        } else if giveback_applies
            && max_favorable > 0.0
            && (max_favorable - favorable_move) >= trade.max_profit_giveback_points
        {
            Some(REASON_GIVEBACK)
        } else if strategy == StrategyType::EmaCross
            && ((side == SignalSide::Long && cvd_below_ema10)
                || (side == SignalSide::Short && cvd_above_ema10))
        {
            Some(REASON_EMA10_CROSS)
        } else if strategy == StrategyType::AtrDivergence
            && ((side == SignalSide::Long && price_above_ema51)
                || (side == SignalSide::Short && price_below_ema51))
        {
            Some(REASON_EMA51_CROSS)
        } else if strategy == StrategyType::RangeBreakout
            && ((side == SignalSide::Long && (price_below_ema10 || price_below_ema51))
                || (side == SignalSide::Short && (price_above_ema10 || price_above_ema51)))
        {
            Some(REASON_BREAKOUT_EXIT)
        } else if strategy == StrategyType::AtrReversal
            && ((side == SignalSide::Long && (price_above_ema51 || cvd_above_ema51))
                || (side == SignalSide::Short && (price_below_ema51 || cvd_below_ema51)))
        {
            Some(REASON_ATR_REVERSAL_EXIT)
        } else {
            None
        };

        if let Some(reason) = exit_reason {
            info!(token, reason, price_close, "CVD automation exit");
            for position in &live {
                self.exit_position_automated(&position.tradingsymbol, reason).await;
            }
            if self.positions.write().remove(&token).is_some() {
                self.persist();
            }
            return;
        }

        // No exit: fold this bar into the trade's memory.
        {
            let mut positions = self.positions.write();
            if let Some(active) = positions.get_mut(&token) {
                active.max_favorable_points = max_favorable;
                active.sl_underlying = sl_underlying;
                active.last_price_close = Some(price_close);
                active.last_ema10 = Some(ema10);
                active.last_ema51 = Some(ema51);
                active.last_cvd_close = Some(cvd_close);
                active.last_cvd_ema10 = Some(cvd_ema10);
                active.last_cvd_ema51 = Some(cvd_ema51);
            }
        }
        self.persist();
    }

    // -------------------------------------------------------------------------
    // Cutoff + reconciliation
    // -------------------------------------------------------------------------

    /// Force-exit every active automation (15:00 rule or kill switch).
    pub async fn enforce_cutoff_exit(&self, reason: &str) {
        let trades: Vec<(u32, AutomationTrade)> = self
            .positions
            .read()
            .iter()
            .map(|(t, tr)| (*t, tr.clone()))
            .collect();
        if trades.is_empty() {
            return;
        }

        for (token, trade) in trades {
            for symbol in trade.tracked_symbols() {
                if self.position_manager.get_position(&symbol).is_some() {
                    self.exit_position_automated(&symbol, reason).await;
                }
            }
            self.retry_timers.stop(token);
            self.positions.write().remove(&token);
        }
        self.persist();
    }

    /// Two seconds after an entry: if neither a position nor a pending order
    /// materialised, the entry failed — drop the trade record.
    pub async fn reconcile_failed_entry(
        self: &Arc<Self>,
        token: u32,
        tradingsymbol: &str,
        signal_timestamp: Option<&str>,
    ) {
        let Some(trade) = self.active_trade(token) else {
            return;
        };
        // A newer signal owns the slot now; leave it alone.
        if let Some(expected) = signal_timestamp {
            if trade.signal_timestamp.as_deref() != Some(expected) {
                return;
            }
        }

        let tracked = if tradingsymbol.is_empty() {
            trade.tradingsymbol.clone()
        } else {
            tradingsymbol.to_string()
        };
        if self.position_manager.get_position(&tracked).is_some() {
            return;
        }
        if self.position_manager.has_pending_order_for(&tracked) {
            self.start_pending_retry(token);
            return;
        }

        warn!(token, tradingsymbol = %tracked, "automation entry never filled — dropping trade");
        self.positions.write().remove(&token);
        self.retry_timers.stop(token);
        self.persist();
    }

    /// Periodic sweep: drop trades whose positions and pending orders are
    /// both gone (e.g. manual exit from the positions table).
    pub async fn reconcile_positions(self: &Arc<Self>) {
        let trades: Vec<(u32, String)> = self
            .positions
            .read()
            .iter()
            .map(|(t, tr)| (*t, tr.tradingsymbol.clone()))
            .collect();

        let mut removed = Vec::new();
        for (token, symbol) in trades {
            if symbol.is_empty() {
                removed.push(token);
                continue;
            }
            if self.position_manager.get_position(&symbol).is_some() {
                continue;
            }
            if self.position_manager.has_pending_order_for(&symbol) {
                self.start_pending_retry(token);
                continue;
            }
            removed.push(token);
        }

        if !removed.is_empty() {
            let mut positions = self.positions.write();
            for token in &removed {
                self.retry_timers.stop(*token);
                positions.remove(token);
            }
            drop(positions);
            self.persist();
        }
    }

    async fn exit_position_automated(&self, tradingsymbol: &str, reason: &str) {
        let Some(position) = self.position_manager.get_position(tradingsymbol) else {
            return;
        };
        self.execution
            .record_exit(tradingsymbol, reason, position.pnl);
        self.position_manager.exit_position(tradingsymbol).await;
    }

    // -------------------------------------------------------------------------
    // Pending-order retry
    // -------------------------------------------------------------------------

    /// True while the entry is still allowed to chase a fill. open_drive is
    /// special-cased to a 3-minute window measured in the signal's own
    /// timezone when it carries one.
    pub(super) fn is_retry_window_open(trade: &AutomationTrade) -> bool {
        if trade.strategy_type != StrategyType::OpenDrive {
            return true;
        }
        let Some(raw) = trade.signal_timestamp.as_deref() else {
            return false;
        };

        let elapsed = if let Ok(aware) = DateTime::parse_from_rfc3339(raw) {
            Utc::now() - aware.with_timezone(&Utc)
        } else if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
            Local::now().naive_local() - naive
        } else {
            return false;
        };

        elapsed <= ChronoDuration::minutes(OPEN_DRIVE_RETRY_WINDOW_MINUTES)
    }

    /// Begin (or keep) the 10-second chase loop for an unfilled entry.
    pub(super) fn start_pending_retry(self: &Arc<Self>, token: u32) {
        // Paper fills are synchronous through the matching engine; only the
        // live path needs the chase loop.
        if self.trading_mode == TradingMode::Paper {
            return;
        }

        let Some(trade) = self.active_trade(token) else {
            self.retry_timers.stop(token);
            return;
        };
        if trade.pending_retry_disabled {
            return;
        }
        if !Self::is_retry_window_open(&trade) {
            if let Some(active) = self.positions.write().get_mut(&token) {
                active.pending_retry_disabled = true;
            }
            info!(token, "skipping pending-order retry outside window");
            self.retry_timers.stop(token);
            return;
        }

        self.retry_timers.start(Arc::clone(self), token);
    }

    /// One retry tick for `token`: cancel the working order, reprice at a
    /// fresh smart limit, resubmit. Stops on fill, on exhaustion, or when
    /// the strategy window closes.
    pub async fn retry_pending_order(self: &Arc<Self>, token: u32) {
        let Some(trade) = self.active_trade(token) else {
            self.retry_timers.stop(token);
            return;
        };
        if trade.pending_retry_disabled {
            self.retry_timers.stop(token);
            return;
        }
        if trade.pending_retry_attempts >= MAX_PENDING_RETRY_ATTEMPTS {
            if let Some(active) = self.positions.write().get_mut(&token) {
                active.pending_retry_disabled = true;
            }
            self.retry_timers.stop(token);
            warn!(token, "pending retry limit reached; stopping retries");
            return;
        }
        if !Self::is_retry_window_open(&trade) {
            if let Some(active) = self.positions.write().get_mut(&token) {
                active.pending_retry_disabled = true;
            }
            self.retry_timers.stop(token);
            info!(token, "pending retry window expired");
            return;
        }

        let tradingsymbol = trade.tradingsymbol.clone();
        if tradingsymbol.is_empty() {
            self.retry_timers.stop(token);
            return;
        }
        if self.position_manager.get_position(&tradingsymbol).is_some() {
            self.retry_timers.stop(token);
            return;
        }

        self.position_manager.refresh_from_api().await;

        let pending = self
            .position_manager
            .get_pending_orders()
            .into_iter()
            .filter(|o| o.tradingsymbol == tradingsymbol && o.status.is_pending())
            .last();
        let Some(pending_order) = pending else {
            info!(token, tradingsymbol = %tradingsymbol, "no pending order left during retry tick");
            return;
        };

        if let Err(err) = self.broker.cancel_order(&pending_order.order_id).await {
            warn!(
                order_id = %pending_order.order_id,
                error = %format!("{err:#}"),
                "could not cancel pending order for retry"
            );
            return;
        }
        self.execution.record_cancelled(&pending_order.order_id);

        let latest_contract = {
            let ladder = self.ladder.read();
            let found = ladder
                .rungs
                .iter()
                .flat_map(|r| [r.call.as_ref(), r.put.as_ref()])
                .flatten()
                .find(|c| c.tradingsymbol == tradingsymbol)
                .cloned();
            found
        };
        let Some(contract) = latest_contract else {
            warn!(tradingsymbol = %tradingsymbol, "latest contract unavailable for retry");
            return;
        };

        let retry_price = calculate_smart_limit_price(&contract);
        let retry_qty = if pending_order.pending_quantity > 0 {
            pending_order.pending_quantity
        } else if pending_order.quantity > 0 {
            pending_order.quantity
        } else {
            trade.quantity
        };
        if retry_qty <= 0 || retry_price <= 0.0 {
            warn!(tradingsymbol = %tradingsymbol, retry_qty, retry_price, "invalid retry parameters");
            return;
        }

        {
            let mut positions = self.positions.write();
            if let Some(active) = positions.get_mut(&token) {
                active.pending_retry_attempts += 1;
            }
        }
        self.persist();

        info!(
            tradingsymbol = %tradingsymbol,
            retry_price,
            retry_qty,
            attempt = trade.pending_retry_attempts + 1,
            "replacing pending automation order at refreshed limit"
        );

        let mut request = ExecutionRequest::new(
            tradingsymbol.clone(),
            pending_order.transaction_type,
            retry_qty,
            OrderType::Limit,
            pending_order.product,
            contract.ltp,
        );
        request.bid = contract.bid;
        request.ask = contract.ask;
        request.limit_price = Some(retry_price);
        request
            .metadata
            .insert("source".to_string(), serde_json::json!("pending_retry"));
        request
            .metadata
            .insert("auto_token".to_string(), serde_json::json!(token));

        let args = BrokerOrderArgs {
            exchange: pending_order.exchange,
            tradingsymbol: tradingsymbol.clone(),
            transaction_type: pending_order.transaction_type,
            quantity: retry_qty,
            product: pending_order.product,
            order_type: OrderType::Limit,
            price: Some(retry_price),
            trigger_price: None,
            group_name: Some(trade.group_name.clone()),
        };

        if let Err(err) = self.execution.execute(&request, self.broker.as_ref(), &args).await {
            warn!(tradingsymbol = %tradingsymbol, error = %err, "pending-order retry placement failed");
        }
    }
}

impl std::fmt::Debug for CvdCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CvdCoordinator")
            .field("trading_mode", &self.trading_mode)
            .field("active_trades", &self.positions.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn finite_or(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        default
    }
}

/// Elapsed minutes between two ISO timestamps; unparseable input counts as
/// zero so a garbled stamp cannot bypass the stacking rule.
fn minutes_between(earlier: Option<&str>, later: Option<&str>) -> f64 {
    let parse = |raw: &str| -> Option<NaiveDateTime> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.naive_utc())
            .ok()
            .or_else(|| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").ok())
            .or_else(|| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok())
    };
    match (earlier.and_then(parse), later.and_then(parse)) {
        (Some(a), Some(b)) => (b - a).num_seconds() as f64 / 60.0,
        _ => 0.0,
    }
}

/// Aggressive-but-passive limit for chasing a fill: bias the midpoint toward
/// the offer and snap to the exchange tick.
fn calculate_smart_limit_price(contract: &Contract) -> f64 {
    const TICK: f64 = 0.05;
    let raw = if contract.ask > 0.0 && contract.bid > 0.0 && contract.ask >= contract.bid {
        contract.bid + (contract.ask - contract.bid) * 0.6
    } else {
        contract.ltp
    };
    (raw / TICK).round() * TICK
}

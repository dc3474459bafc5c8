// =============================================================================
// Position Manager — authoritative in-process ledger of positions and
// pending orders
// =============================================================================
//
// Owns the reconciliation between broker state and local runtime state:
//
//   - refreshes pull `positions()` + `orders()` and differentiate holdings
//     from working orders;
//   - locally-set SL/TP/TSL survive refreshes and are re-anchored when a
//     position is averaged into (quantity increase only);
//   - per-tick updates recompute PnL, tighten trailing stops monotonically
//     and fire side-aware SL/TP exits;
//   - portfolio-level stop/target latches once per arming cycle.
//
// Refreshes are serialised by an atomic gate: an overlapping refresh is
// discarded, not queued. API failures surface as events and the manager
// keeps running on stale data.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::broker::{BrokerClient, BrokerOrderArgs, BrokerPosition, BROKER_CALL_TIMEOUT, OrderRecord};
use crate::events::{EngineEvent, EventBus};
use crate::types::{Contract, OrderType, PendingOrder, Position, Tick, TradingMode, TransactionType};

struct Inner {
    positions: HashMap<String, Position>,
    pending_orders: Vec<PendingOrder>,
    exit_in_progress: HashSet<String>,
    group_name_hints: HashMap<String, String>,
    /// tradingsymbol → contract metadata from the instrument loader.
    instrument_map: HashMap<String, Contract>,
    portfolio_stop_loss: Option<f64>,
    portfolio_target: Option<f64>,
    portfolio_exit_triggered: bool,
    last_refresh_time: Option<DateTime<Utc>>,
}

pub struct PositionManager {
    broker: Arc<dyn BrokerClient>,
    trading_mode: TradingMode,
    bus: EventBus,
    inner: RwLock<Inner>,
    refresh_in_progress: AtomicBool,
}

impl PositionManager {
    pub fn new(broker: Arc<dyn BrokerClient>, trading_mode: TradingMode, bus: EventBus) -> Self {
        Self {
            broker,
            trading_mode,
            bus,
            inner: RwLock::new(Inner {
                positions: HashMap::new(),
                pending_orders: Vec::new(),
                exit_in_progress: HashSet::new(),
                group_name_hints: HashMap::new(),
                instrument_map: HashMap::new(),
                portfolio_stop_loss: None,
                portfolio_target: None,
                portfolio_exit_triggered: false,
                last_refresh_time: None,
            }),
            refresh_in_progress: AtomicBool::new(false),
        }
    }

    /// Install contract metadata so refreshed positions pick up tokens,
    /// lot sizes and expiries.
    pub fn set_instrument_data(&self, contracts: HashMap<String, Contract>) {
        let mut inner = self.inner.write();
        info!(count = contracts.len(), "position manager received instrument data");
        inner.instrument_map = contracts;
    }

    // -------------------------------------------------------------------------
    // Portfolio-level kill switches
    // -------------------------------------------------------------------------

    /// Arm portfolio SL/TP. The stop is a negative rupee level, the target a
    /// positive one; out-of-range values disarm that side.
    pub fn set_portfolio_sl_tp(&self, stop_loss: f64, target: f64) {
        let mut inner = self.inner.write();
        inner.portfolio_stop_loss = (stop_loss < 0.0).then_some(stop_loss);
        inner.portfolio_target = (target > 0.0).then_some(target);
        inner.portfolio_exit_triggered = false;
        warn!(
            stop_loss = ?inner.portfolio_stop_loss,
            target = ?inner.portfolio_target,
            "portfolio SL/TP armed"
        );
    }

    pub fn clear_portfolio_sl_tp(&self) {
        let mut inner = self.inner.write();
        inner.portfolio_stop_loss = None;
        inner.portfolio_target = None;
        inner.portfolio_exit_triggered = false;
        info!("portfolio SL/TP cleared");
    }

    // -------------------------------------------------------------------------
    // Refresh protocol
    // -------------------------------------------------------------------------

    /// Pull broker state and reconcile. Overlapping refreshes are discarded.
    pub async fn refresh_from_api(&self) {
        if self
            .refresh_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let result = self.fetch_broker_state().await;
        match result {
            Ok((positions, orders)) => {
                self.process_orders_and_positions(positions, orders);
                self.inner.write().last_refresh_time = Some(Utc::now());
                self.bus.publish(EngineEvent::RefreshCompleted { ok: true });
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "position refresh failed");
                self.bus.publish(EngineEvent::ApiError {
                    message: format!("{err:#}"),
                });
                self.bus.publish(EngineEvent::RefreshCompleted { ok: false });
            }
        }

        self.refresh_in_progress.store(false, Ordering::SeqCst);
    }

    async fn fetch_broker_state(
        &self,
    ) -> anyhow::Result<(Vec<BrokerPosition>, Vec<OrderRecord>)> {
        let positions =
            tokio::time::timeout(BROKER_CALL_TIMEOUT, self.broker.positions()).await??;
        let orders = tokio::time::timeout(BROKER_CALL_TIMEOUT, self.broker.orders()).await??;
        Ok((positions, orders))
    }

    fn process_orders_and_positions(
        &self,
        api_positions: Vec<BrokerPosition>,
        api_orders: Vec<OrderRecord>,
    ) {
        let mut removed: Vec<String> = Vec::new();

        {
            let inner = &mut *self.inner.write();

            let pending: Vec<PendingOrder> = api_orders
                .iter()
                .filter(|o| {
                    matches!(
                        o.status,
                        crate::types::OrderStatus::TriggerPending
                            | crate::types::OrderStatus::Open
                            | crate::types::OrderStatus::AmoReqReceived
                    )
                })
                .map(OrderRecord::to_pending)
                .collect();

            let mut current: HashMap<String, Position> = HashMap::new();

            for api_pos in api_positions {
                if api_pos.quantity == 0 {
                    continue;
                }

                let mut pos = Self::convert_api_position(inner, &api_pos);
                let existing = inner.positions.get(&pos.tradingsymbol);
                let is_new_position = existing.is_none();

                if is_new_position {
                    if let Some(hint) = inner.group_name_hints.get(&pos.tradingsymbol) {
                        pos.group_name = Some(hint.clone());
                    }
                    // Fall back to the broker's own group if it carries one.
                    if pos.group_name.is_none() {
                        pos.group_name = api_pos.group_name.clone();
                    }
                } else {
                    inner.group_name_hints.remove(&pos.tradingsymbol);
                }

                // Lifecycle flag: stays true until the refresh after the one
                // that first saw the position.
                pos.is_new = existing.map(|e| e.is_new).unwrap_or(is_new_position);

                if let Some(existing) = existing {
                    // Preserve runtime / OMS state across refreshes.
                    pos.order_id = existing.order_id.clone();
                    pos.stop_loss_order_id = existing.stop_loss_order_id.clone();
                    pos.target_order_id = existing.target_order_id.clone();
                    pos.pnl = existing.pnl;
                    pos.entry_time = existing.entry_time;
                    pos.trade_status = existing.trade_status.clone();
                    pos.strategy_name = existing.strategy_name.clone();

                    // Locally-set risk levels ALWAYS survive a refresh.
                    pos.stop_loss_price = existing.stop_loss_price;
                    pos.target_price = existing.target_price;
                    pos.trailing_stop_loss = existing.trailing_stop_loss;
                    pos.group_name = existing.group_name.clone();

                    // True averaging — quantity increase only.
                    if pos.quantity.abs() > existing.quantity.abs() {
                        Self::recalculate_sl_tp_on_averaging(&mut pos, existing);
                    }

                    pos.is_exiting = inner.exit_in_progress.contains(&pos.tradingsymbol);
                }

                current.insert(pos.tradingsymbol.clone(), pos);
            }

            // Synchronise: symbols gone at the broker leave the ledger.
            for symbol in inner.positions.keys() {
                if !current.contains_key(symbol) {
                    removed.push(symbol.clone());
                }
            }
            for symbol in &removed {
                inner.exit_in_progress.remove(symbol);
                inner.group_name_hints.remove(symbol);
            }
            inner.positions = current;

            // Contracts past expiry have settled; drop them.
            let today = Local::now().date_naive();
            let expired: Vec<String> = inner
                .positions
                .iter()
                .filter(|(_, p)| p.contract.expiry.map(|e| e < today).unwrap_or(false))
                .map(|(s, _)| s.clone())
                .collect();
            for symbol in expired {
                info!(tradingsymbol = %symbol, "removing expired position");
                inner.positions.remove(&symbol);
                removed.push(symbol);
            }

            // Clear is_new only after the full refresh cycle.
            for pos in inner.positions.values_mut() {
                pos.is_new = false;
            }

            inner.pending_orders = pending;
        }

        for symbol in removed {
            self.bus
                .publish(EngineEvent::PositionRemoved { tradingsymbol: symbol });
        }
        self.publish_position_events();
    }

    fn convert_api_position(inner: &Inner, api_pos: &BrokerPosition) -> Position {
        let contract = inner
            .instrument_map
            .get(&api_pos.tradingsymbol)
            .cloned()
            .unwrap_or_else(|| {
                warn!(
                    tradingsymbol = %api_pos.tradingsymbol,
                    "no instrument details for position; real-time PnL will not update"
                );
                Contract::unknown(&api_pos.tradingsymbol, api_pos.instrument_token)
            });

        Position {
            symbol: api_pos.tradingsymbol.clone(),
            tradingsymbol: api_pos.tradingsymbol.clone(),
            quantity: api_pos.quantity,
            average_price: api_pos.average_price,
            ltp: api_pos.last_price,
            pnl: api_pos.pnl,
            product: api_pos.product,
            exchange: api_pos.exchange,
            contract,
            order_id: None,
            stop_loss_order_id: None,
            target_order_id: None,
            stop_loss_price: None,
            target_price: None,
            trailing_stop_loss: None,
            group_name: None,
            entry_time: None,
            is_exiting: false,
            is_new: false,
            trade_status: "MANUAL".to_string(),
            strategy_name: "N/A".to_string(),
        }
    }

    /// Scale-in handling: keep the rupee risk proportional to the enlarged
    /// quantity rather than pinning the old absolute price levels.
    fn recalculate_sl_tp_on_averaging(new_pos: &mut Position, old_pos: &Position) {
        if old_pos.is_new {
            return;
        }
        if new_pos.quantity.abs() <= old_pos.quantity.abs() {
            return;
        }
        if old_pos.stop_loss_price.is_none() && old_pos.target_price.is_none() {
            return;
        }

        let scale = new_pos.quantity.abs() as f64 / old_pos.quantity.abs() as f64;

        if let Some(old_sl) = old_pos.stop_loss_price {
            let old_amount = (old_pos.average_price - old_sl).abs() * old_pos.quantity.abs() as f64;
            let per_unit = old_amount * scale / new_pos.quantity.abs() as f64;
            new_pos.stop_loss_price = Some(if new_pos.quantity > 0 {
                new_pos.average_price - per_unit
            } else {
                new_pos.average_price + per_unit
            });
            info!(
                tradingsymbol = %new_pos.tradingsymbol,
                old_qty = old_pos.quantity,
                new_qty = new_pos.quantity,
                new_sl = ?new_pos.stop_loss_price,
                "stop loss recalculated on averaging"
            );
        }

        if let Some(old_tp) = old_pos.target_price {
            let old_amount = (old_tp - old_pos.average_price).abs() * old_pos.quantity.abs() as f64;
            let per_unit = old_amount * scale / new_pos.quantity.abs() as f64;
            new_pos.target_price = Some(if new_pos.quantity > 0 {
                new_pos.average_price + per_unit
            } else {
                new_pos.average_price - per_unit
            });
        }
    }

    // -------------------------------------------------------------------------
    // Per-tick update
    // -------------------------------------------------------------------------

    /// Apply a tick batch: recompute PnL, tighten trailing stops and exit
    /// any position whose SL/TP is breached. Finishes with the portfolio
    /// SL/TP evaluation.
    pub async fn update_pnl_from_market_data(&self, ticks: &[Tick]) {
        let mut to_exit: Vec<String> = Vec::new();
        let mut updated = false;

        {
            let mut inner = self.inner.write();
            let ticks_by_token: HashMap<u32, &Tick> =
                ticks.iter().map(|t| (t.instrument_token, t)).collect();

            for pos in inner.positions.values_mut() {
                if pos.is_exiting {
                    continue;
                }
                let Some(tick) = ticks_by_token.get(&pos.contract.instrument_token) else {
                    continue;
                };
                let ltp = tick.last_price;
                if ltp == pos.ltp {
                    continue;
                }

                pos.ltp = ltp;
                pos.pnl = (ltp - pos.average_price) * pos.quantity as f64;
                updated = true;

                if pos.trailing_stop_loss.map(|t| t > 0.0).unwrap_or(false) {
                    Self::update_trailing_stop(pos, ltp);
                }

                if let Some(sl) = pos.stop_loss_price {
                    let breached =
                        (pos.quantity > 0 && ltp <= sl) || (pos.quantity < 0 && ltp >= sl);
                    if breached {
                        warn!(tradingsymbol = %pos.tradingsymbol, ltp, sl, "stop loss hit");
                        to_exit.push(pos.tradingsymbol.clone());
                        continue;
                    }
                }

                if let Some(tp) = pos.target_price {
                    let reached =
                        (pos.quantity > 0 && ltp >= tp) || (pos.quantity < 0 && ltp <= tp);
                    if reached {
                        warn!(tradingsymbol = %pos.tradingsymbol, ltp, tp, "target hit");
                        to_exit.push(pos.tradingsymbol.clone());
                    }
                }
            }
        }

        for symbol in to_exit {
            self.exit_position(&symbol).await;
        }

        if updated {
            self.publish_position_events();
        }

        self.check_portfolio_sl_tp();
    }

    /// Tighten the stop monotonically: long stops only rise, short stops
    /// only fall.
    fn update_trailing_stop(pos: &mut Position, ltp: f64) {
        let trail = pos.trailing_stop_loss.unwrap_or(0.0);

        let Some(current) = pos.stop_loss_price else {
            pos.stop_loss_price = Some(if pos.quantity > 0 { ltp - trail } else { ltp + trail });
            return;
        };

        if pos.quantity > 0 {
            let candidate = ltp - trail;
            if candidate > current {
                pos.stop_loss_price = Some(candidate);
                info!(tradingsymbol = %pos.tradingsymbol, sl = candidate, "trailing stop tightened (long)");
            }
        } else {
            let candidate = ltp + trail;
            if candidate < current {
                pos.stop_loss_price = Some(candidate);
                info!(tradingsymbol = %pos.tradingsymbol, sl = candidate, "trailing stop tightened (short)");
            }
        }
    }

    fn check_portfolio_sl_tp(&self) {
        let fired = {
            let mut inner = self.inner.write();
            if inner.portfolio_exit_triggered {
                return;
            }
            if inner.portfolio_stop_loss.is_none() && inner.portfolio_target.is_none() {
                return;
            }

            let total_pnl: f64 = inner.positions.values().map(|p| p.pnl).sum();

            let mut fired = None;
            if let Some(stop) = inner.portfolio_stop_loss {
                if total_pnl <= stop {
                    fired = Some(("STOP_LOSS", total_pnl));
                }
            }
            if fired.is_none() {
                if let Some(target) = inner.portfolio_target {
                    if total_pnl >= target {
                        fired = Some(("TARGET", total_pnl));
                    }
                }
            }
            if fired.is_some() {
                inner.portfolio_exit_triggered = true;
            }
            fired
        };

        if let Some((reason, pnl)) = fired {
            error!(reason, pnl, "portfolio exit triggered");
            self.bus.publish(EngineEvent::PortfolioExit {
                reason: reason.to_string(),
                pnl,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Exits
    // -------------------------------------------------------------------------

    /// Exit one position. Idempotent per symbol: a second call while the
    /// first exit is in flight is a no-op.
    pub async fn exit_position(&self, tradingsymbol: &str) {
        let position = {
            let mut inner = self.inner.write();
            if inner.exit_in_progress.contains(tradingsymbol) {
                info!(tradingsymbol, "exit already in progress");
                return;
            }
            if !inner.positions.contains_key(tradingsymbol) {
                return;
            }
            inner.exit_in_progress.insert(tradingsymbol.to_string());
            let pos = inner.positions.get_mut(tradingsymbol).unwrap();
            pos.is_exiting = true;
            pos.clone()
        };

        // Paper mode: the simulator already received the exit order from the
        // caller's flow; just drop the entry.
        if self.trading_mode == TradingMode::Paper {
            self.remove_after_exit(tradingsymbol);
            self.inner.write().exit_in_progress.remove(tradingsymbol);
            return;
        }

        let args = BrokerOrderArgs {
            exchange: position.exchange,
            tradingsymbol: position.tradingsymbol.clone(),
            transaction_type: if position.quantity > 0 {
                TransactionType::Sell
            } else {
                TransactionType::Buy
            },
            quantity: position.quantity.abs(),
            product: position.product,
            order_type: OrderType::Market,
            price: None,
            trigger_price: None,
            group_name: None,
        };

        match tokio::time::timeout(BROKER_CALL_TIMEOUT, self.broker.place_order(&args)).await {
            Ok(Ok(order_id)) => {
                info!(tradingsymbol, order_id = %order_id, "exit order placed");
                self.remove_after_exit(tradingsymbol);
            }
            Ok(Err(err)) => {
                error!(tradingsymbol, error = %format!("{err:#}"), "failed to exit position");
                if let Some(pos) = self.inner.write().positions.get_mut(tradingsymbol) {
                    pos.is_exiting = false;
                }
                self.publish_position_events();
            }
            Err(_) => {
                error!(tradingsymbol, "exit order timed out");
                if let Some(pos) = self.inner.write().positions.get_mut(tradingsymbol) {
                    pos.is_exiting = false;
                }
                self.publish_position_events();
            }
        }

        self.inner.write().exit_in_progress.remove(tradingsymbol);
    }

    fn remove_after_exit(&self, tradingsymbol: &str) {
        let removed = {
            let mut inner = self.inner.write();
            inner.group_name_hints.remove(tradingsymbol);
            inner.positions.remove(tradingsymbol).is_some()
        };
        if removed {
            self.bus.publish(EngineEvent::PositionRemoved {
                tradingsymbol: tradingsymbol.to_string(),
            });
            self.publish_position_events();
            self.bus.publish(EngineEvent::RefreshCompleted { ok: true });
        }
    }

    /// Exit every position in the list that is non-zero and not already
    /// exiting. Used by the kill switch and the automation cutoff.
    pub async fn execute_bulk_exit(&self, tradingsymbols: Vec<String>) {
        for symbol in tradingsymbols {
            let eligible = {
                let inner = self.inner.read();
                inner
                    .positions
                    .get(&symbol)
                    .map(|p| p.quantity != 0 && !p.is_exiting)
                    .unwrap_or(false)
            };
            if eligible {
                self.exit_position(&symbol).await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Local mutations
    // -------------------------------------------------------------------------

    /// Enroll a position created locally from a confirmed fill (live flow).
    pub fn add_position(&self, position: Position) {
        {
            let mut inner = self.inner.write();
            if let Some(group) = &position.group_name {
                inner
                    .group_name_hints
                    .insert(position.tradingsymbol.clone(), group.clone());
            }
            inner
                .positions
                .insert(position.tradingsymbol.clone(), position);
        }
        self.publish_position_events();
    }

    pub fn set_group_name_hint(&self, tradingsymbol: &str, group_name: Option<&str>) {
        if tradingsymbol.is_empty() {
            return;
        }
        if let Some(group) = group_name.filter(|g| !g.is_empty()) {
            self.inner
                .write()
                .group_name_hints
                .insert(tradingsymbol.to_string(), group.to_string());
        }
    }

    /// Update SL/TP/TSL on an open position; values ≤ 0 clear the field.
    pub fn update_sl_tp_for_position(
        &self,
        tradingsymbol: &str,
        sl_price: Option<f64>,
        tp_price: Option<f64>,
        tsl_value: Option<f64>,
    ) {
        {
            let mut inner = self.inner.write();
            let Some(pos) = inner.positions.get_mut(tradingsymbol) else {
                warn!(tradingsymbol, "SL/TP update ignored — position already closed");
                return;
            };
            pos.stop_loss_price = sl_price.filter(|v| *v > 0.0);
            pos.target_price = tp_price.filter(|v| *v > 0.0);
            pos.trailing_stop_loss = tsl_value.filter(|v| *v > 0.0);
            info!(
                tradingsymbol,
                sl = ?pos.stop_loss_price,
                tp = ?pos.target_price,
                tsl = ?pos.trailing_stop_loss,
                "local SL/TP updated"
            );
        }
        self.publish_position_events();
    }

    pub fn remove_position(&self, tradingsymbol: &str) {
        self.remove_after_exit(tradingsymbol);
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_all_positions(&self) -> Vec<Position> {
        self.inner.read().positions.values().cloned().collect()
    }

    pub fn get_position(&self, tradingsymbol: &str) -> Option<Position> {
        self.inner.read().positions.get(tradingsymbol).cloned()
    }

    pub fn has_positions(&self) -> bool {
        !self.inner.read().positions.is_empty()
    }

    pub fn get_pending_orders(&self) -> Vec<PendingOrder> {
        self.inner.read().pending_orders.clone()
    }

    /// Whether a working order exists for `tradingsymbol`.
    pub fn has_pending_order_for(&self, tradingsymbol: &str) -> bool {
        self.inner
            .read()
            .pending_orders
            .iter()
            .any(|o| o.tradingsymbol == tradingsymbol && o.status.is_pending())
    }

    pub fn get_total_pnl(&self) -> f64 {
        self.inner.read().positions.values().map(|p| p.pnl).sum()
    }

    pub fn last_refresh_time(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_refresh_time
    }

    fn publish_position_events(&self) {
        let (positions, pending) = {
            let inner = self.inner.read();
            (
                inner.positions.values().cloned().collect::<Vec<_>>(),
                inner.pending_orders.clone(),
            )
        };
        self.bus.publish(EngineEvent::PositionChanged { positions });
        self.bus
            .publish(EngineEvent::PendingOrdersUpdated { orders: pending });
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PositionManager")
            .field("positions", &inner.positions.len())
            .field("pending_orders", &inner.pending_orders.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Exchange, OptionType, OrderStatus, ProductType};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    struct MockBroker {
        positions: Mutex<Vec<BrokerPosition>>,
        orders: Mutex<Vec<OrderRecord>>,
        placed: Mutex<Vec<BrokerOrderArgs>>,
    }

    impl MockBroker {
        fn new() -> Self {
            Self {
                positions: Mutex::new(Vec::new()),
                orders: Mutex::new(Vec::new()),
                placed: Mutex::new(Vec::new()),
            }
        }

        fn set_positions(&self, positions: Vec<BrokerPosition>) {
            *self.positions.lock() = positions;
        }
    }

    #[async_trait]
    impl BrokerClient for MockBroker {
        async fn place_order(&self, args: &BrokerOrderArgs) -> anyhow::Result<String> {
            self.placed.lock().push(args.clone());
            Ok(format!("exit_{}", self.placed.lock().len()))
        }

        async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn positions(&self) -> anyhow::Result<Vec<BrokerPosition>> {
            Ok(self.positions.lock().clone())
        }

        async fn orders(&self) -> anyhow::Result<Vec<OrderRecord>> {
            Ok(self.orders.lock().clone())
        }

        async fn profile(&self) -> anyhow::Result<Value> {
            Ok(json!({"user_id": "TEST"}))
        }

        async fn margins(&self) -> anyhow::Result<Value> {
            Ok(json!({}))
        }
    }

    fn broker_pos(symbol: &str, qty: i64, avg: f64) -> BrokerPosition {
        BrokerPosition {
            tradingsymbol: symbol.to_string(),
            quantity: qty,
            average_price: avg,
            last_price: avg,
            pnl: 0.0,
            realized_pnl: 0.0,
            instrument_token: 0,
            product: ProductType::Mis,
            exchange: Exchange::Nfo,
            group_name: None,
        }
    }

    fn contract(symbol: &str, token: u32, expiry: Option<chrono::NaiveDate>) -> Contract {
        Contract {
            symbol: "NIFTY".to_string(),
            tradingsymbol: symbol.to_string(),
            instrument_token: token,
            lot_size: 25,
            strike: 24500.0,
            option_type: OptionType::Call,
            expiry,
            ltp: 0.0,
            bid: 0.0,
            ask: 0.0,
            oi: 0.0,
        }
    }

    fn manager(mode: TradingMode) -> (Arc<MockBroker>, PositionManager) {
        let broker = Arc::new(MockBroker::new());
        let manager = PositionManager::new(broker.clone(), mode, EventBus::new());
        let far_expiry = Local::now().date_naive() + chrono::Days::new(30);
        manager.set_instrument_data(HashMap::from([(
            "NIFTY24DEC24500CE".to_string(),
            contract("NIFTY24DEC24500CE", 256265, Some(far_expiry)),
        )]));
        (broker, manager)
    }

    fn tick(token: u32, price: f64) -> Tick {
        Tick {
            instrument_token: token,
            last_price: price,
            bid: 0.0,
            ask: 0.0,
            oi: 0.0,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn refresh_enrolls_positions_and_clears_is_new() {
        let (broker, manager) = manager(TradingMode::Paper);
        broker.set_positions(vec![broker_pos("NIFTY24DEC24500CE", 50, 120.0)]);

        manager.refresh_from_api().await;

        let pos = manager.get_position("NIFTY24DEC24500CE").unwrap();
        assert_eq!(pos.quantity, 50);
        // is_new is an intra-refresh flag; it is cleared once the cycle ends.
        assert!(!pos.is_new);
        assert_eq!(pos.contract.instrument_token, 256265);
    }

    #[tokio::test]
    async fn refresh_preserves_local_risk_levels() {
        let (broker, manager) = manager(TradingMode::Paper);
        broker.set_positions(vec![broker_pos("NIFTY24DEC24500CE", 50, 120.0)]);
        manager.refresh_from_api().await;

        manager.update_sl_tp_for_position(
            "NIFTY24DEC24500CE",
            Some(110.0),
            Some(140.0),
            Some(5.0),
        );

        manager.refresh_from_api().await;
        let pos = manager.get_position("NIFTY24DEC24500CE").unwrap();
        assert_eq!(pos.stop_loss_price, Some(110.0));
        assert_eq!(pos.target_price, Some(140.0));
        assert_eq!(pos.trailing_stop_loss, Some(5.0));
    }

    #[tokio::test]
    async fn averaging_recomputes_sl_tp_proportionally() {
        let (broker, manager) = manager(TradingMode::Paper);
        broker.set_positions(vec![broker_pos("NIFTY24DEC24500CE", 100, 10.0)]);
        manager.refresh_from_api().await;
        // Risk: (10 - 8) × 100 = 200 rupees; reward (14 - 10) × 100 = 400.
        manager.update_sl_tp_for_position("NIFTY24DEC24500CE", Some(8.0), Some(14.0), None);

        // Average in: now 200 @ 11.
        broker.set_positions(vec![broker_pos("NIFTY24DEC24500CE", 200, 11.0)]);
        manager.refresh_from_api().await;

        let pos = manager.get_position("NIFTY24DEC24500CE").unwrap();
        // New risk 400 over 200 units → 2/unit → SL 9; reward 800 → 4/unit → TP 15.
        assert!((pos.stop_loss_price.unwrap() - 9.0).abs() < 1e-9);
        assert!((pos.target_price.unwrap() - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn quantity_reduction_keeps_original_levels() {
        let (broker, manager) = manager(TradingMode::Paper);
        broker.set_positions(vec![broker_pos("NIFTY24DEC24500CE", 100, 10.0)]);
        manager.refresh_from_api().await;
        manager.update_sl_tp_for_position("NIFTY24DEC24500CE", Some(8.0), None, None);

        broker.set_positions(vec![broker_pos("NIFTY24DEC24500CE", 50, 10.0)]);
        manager.refresh_from_api().await;

        let pos = manager.get_position("NIFTY24DEC24500CE").unwrap();
        assert_eq!(pos.stop_loss_price, Some(8.0));
    }

    #[tokio::test]
    async fn absent_symbols_are_removed_with_event() {
        let (broker, manager) = manager(TradingMode::Paper);
        let mut rx = manager.bus.subscribe();

        broker.set_positions(vec![broker_pos("NIFTY24DEC24500CE", 50, 120.0)]);
        manager.refresh_from_api().await;

        broker.set_positions(vec![]);
        manager.refresh_from_api().await;
        assert!(manager.get_position("NIFTY24DEC24500CE").is_none());

        let mut saw_removed = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::PositionRemoved { tradingsymbol } = event {
                assert_eq!(tradingsymbol, "NIFTY24DEC24500CE");
                saw_removed = true;
            }
        }
        assert!(saw_removed);
    }

    #[tokio::test]
    async fn tick_updates_pnl_and_tightens_trailing_stop() {
        let (broker, manager) = manager(TradingMode::Paper);
        broker.set_positions(vec![broker_pos("NIFTY24DEC24500CE", 50, 120.0)]);
        manager.refresh_from_api().await;
        manager.update_sl_tp_for_position("NIFTY24DEC24500CE", Some(110.0), None, Some(5.0));

        manager.update_pnl_from_market_data(&[tick(256265, 130.0)]).await;
        let pos = manager.get_position("NIFTY24DEC24500CE").unwrap();
        assert!((pos.pnl - 500.0).abs() < 1e-9);
        // TSL lifted the stop to 125.
        assert!((pos.stop_loss_price.unwrap() - 125.0).abs() < 1e-9);

        // Price falls back a little: the stop must NOT widen.
        manager.update_pnl_from_market_data(&[tick(256265, 127.0)]).await;
        let pos = manager.get_position("NIFTY24DEC24500CE").unwrap();
        assert!((pos.stop_loss_price.unwrap() - 125.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn short_trailing_stop_only_falls() {
        let (broker, manager) = manager(TradingMode::Paper);
        broker.set_positions(vec![broker_pos("NIFTY24DEC24500CE", -50, 120.0)]);
        manager.refresh_from_api().await;
        manager.update_sl_tp_for_position("NIFTY24DEC24500CE", Some(130.0), None, Some(5.0));

        manager.update_pnl_from_market_data(&[tick(256265, 110.0)]).await;
        let pos = manager.get_position("NIFTY24DEC24500CE").unwrap();
        assert!((pos.stop_loss_price.unwrap() - 115.0).abs() < 1e-9);

        manager.update_pnl_from_market_data(&[tick(256265, 113.0)]).await;
        let pos = manager.get_position("NIFTY24DEC24500CE").unwrap();
        assert!((pos.stop_loss_price.unwrap() - 115.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stop_breach_exits_position_in_paper_mode() {
        let (broker, manager) = manager(TradingMode::Paper);
        broker.set_positions(vec![broker_pos("NIFTY24DEC24500CE", 50, 120.0)]);
        manager.refresh_from_api().await;
        manager.update_sl_tp_for_position("NIFTY24DEC24500CE", Some(110.0), None, None);

        manager.update_pnl_from_market_data(&[tick(256265, 109.0)]).await;
        // Paper exits drop the entry; the simulator's own flow placed the order.
        assert!(manager.get_position("NIFTY24DEC24500CE").is_none());
    }

    #[tokio::test]
    async fn live_exit_places_inverse_market_order() {
        let (broker, manager) = manager(TradingMode::Live);
        broker.set_positions(vec![broker_pos("NIFTY24DEC24500CE", -50, 120.0)]);
        manager.refresh_from_api().await;

        manager.exit_position("NIFTY24DEC24500CE").await;

        let placed = broker.placed.lock();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].transaction_type, TransactionType::Buy);
        assert_eq!(placed[0].quantity, 50);
        assert_eq!(placed[0].order_type, OrderType::Market);
        drop(placed);
        assert!(manager.get_position("NIFTY24DEC24500CE").is_none());
    }

    #[tokio::test]
    async fn portfolio_stop_loss_latches_once() {
        let (broker, manager) = manager(TradingMode::Paper);
        broker.set_positions(vec![broker_pos("NIFTY24DEC24500CE", 50, 120.0)]);
        manager.refresh_from_api().await;
        manager.set_portfolio_sl_tp(-400.0, 0.0);

        let bus = {
            // Count PortfolioExit events across two breaching ticks.
            let mut count = 0;
            let rx_bus = manager.bus.clone();
            let mut rx = rx_bus.subscribe();
            manager.update_pnl_from_market_data(&[tick(256265, 110.0)]).await; // pnl -500
            manager.update_pnl_from_market_data(&[tick(256265, 108.0)]).await;
            while let Ok(event) = rx.try_recv() {
                if let EngineEvent::PortfolioExit { reason, pnl } = event {
                    assert_eq!(reason, "STOP_LOSS");
                    assert!(pnl <= -400.0);
                    count += 1;
                }
            }
            count
        };
        assert_eq!(bus, 1);
    }

    #[tokio::test]
    async fn pending_orders_filter_working_statuses() {
        let (broker, manager) = manager(TradingMode::Paper);
        let base = OrderRecord {
            order_id: "1".into(),
            tradingsymbol: "NIFTY24DEC24500CE".into(),
            transaction_type: TransactionType::Buy,
            quantity: 50,
            order_type: OrderType::Limit,
            product: ProductType::Mis,
            exchange: Exchange::Nfo,
            status: OrderStatus::Open,
            price: Some(120.0),
            trigger_price: None,
            order_timestamp: String::new(),
            average_price: 0.0,
            filled_quantity: 0,
            pending_quantity: 50,
            exchange_timestamp: None,
            group_name: None,
            entry_qty: 0,
            exit_qty: 0,
            realized_pnl: 0.0,
        };
        let mut complete = base.clone();
        complete.order_id = "2".into();
        complete.status = OrderStatus::Complete;
        let mut trigger_pending = base.clone();
        trigger_pending.order_id = "3".into();
        trigger_pending.status = OrderStatus::TriggerPending;
        *broker.orders.lock() = vec![base, complete, trigger_pending];

        manager.refresh_from_api().await;

        let pending = manager.get_pending_orders();
        assert_eq!(pending.len(), 2);
        assert!(manager.has_pending_order_for("NIFTY24DEC24500CE"));
        assert!(!manager.has_pending_order_for("BANKNIFTY"));
    }

    #[tokio::test]
    async fn locally_added_position_registers_group_hint() {
        let (_broker, manager) = manager(TradingMode::Paper);
        let far_expiry = Local::now().date_naive() + chrono::Days::new(30);

        let mut pos = super::PositionManager::convert_api_position(
            &manager.inner.read(),
            &broker_pos("NIFTY24DEC24500CE", 50, 120.0),
        );
        pos.contract = contract("NIFTY24DEC24500CE", 256265, Some(far_expiry));
        pos.group_name = Some("CVD_AUTO_256265".to_string());
        manager.add_position(pos);

        assert!(manager.get_position("NIFTY24DEC24500CE").is_some());
        assert!(manager.has_positions());
        // The hint survives for the next broker refresh to re-apply.
        assert_eq!(
            manager.inner.read().group_name_hints.get("NIFTY24DEC24500CE"),
            Some(&"CVD_AUTO_256265".to_string())
        );
    }

    #[tokio::test]
    async fn expired_contracts_are_pruned_after_refresh() {
        let broker = Arc::new(MockBroker::new());
        let manager = PositionManager::new(broker.clone(), TradingMode::Paper, EventBus::new());
        let yesterday = Local::now().date_naive() - chrono::Days::new(1);
        manager.set_instrument_data(HashMap::from([(
            "NIFTY24DEC24500CE".to_string(),
            contract("NIFTY24DEC24500CE", 256265, Some(yesterday)),
        )]));
        broker.set_positions(vec![broker_pos("NIFTY24DEC24500CE", 50, 120.0)]);

        manager.refresh_from_api().await;
        assert!(manager.get_position("NIFTY24DEC24500CE").is_none());
    }
}

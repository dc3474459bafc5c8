// =============================================================================
// Paper trading simulator — deterministic in-process matching engine
// =============================================================================
//
// Mirrors the live broker contract so the engine can swap it in behind the
// `BrokerClient` trait. Execution semantics:
//
//   - MARKET executes at LTP when one is known, else parks as
//     PENDING_EXECUTION until the first tick.
//   - LIMIT BUY executes when LTP <= limit (at LTP — a better price);
//     LIMIT SELL when LTP >= limit.
//   - SL / SL-M ALWAYS start as TRIGGER PENDING and are matched by the
//     1 Hz tick engine: SELL triggers at LTP <= trigger (protective long
//     stop), BUY at LTP >= trigger (protective short stop / target).
//
// Fills annotate the order record with entry_qty / exit_qty / realized_pnl
// so the ledger recorder upstream can write closed trades without replaying
// position state. Account state persists to `paper_account.json` after
// every fill.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::broker::{BrokerClient, BrokerOrderArgs, BrokerPosition, OrderRecord};
use crate::events::{EngineEvent, EventBus};
use crate::paper::rms::PaperRms;
use crate::types::{OrderStatus, OrderType, Tick, TransactionType};

/// Default simulated account balance.
pub const DEFAULT_STARTING_BALANCE: f64 = 1_000_000.0;

/// Cadence of the matching tick.
pub const MATCHING_INTERVAL_SECS: u64 = 1;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One simulated holding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperPosition {
    pub tradingsymbol: String,
    pub quantity: i64,
    pub average_price: f64,
    pub last_price: f64,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    pub product: crate::types::ProductType,
    pub exchange: crate::types::Exchange,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub group_name: Option<String>,
}

/// Durable account snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct PaperState {
    balance: f64,
    positions: HashMap<String, PaperPosition>,
    #[serde(default)]
    rms_used_margin: f64,
}

struct PaperInner {
    market_data: HashMap<u32, Tick>,
    tradingsymbol_to_token: HashMap<String, u32>,
    positions: HashMap<String, PaperPosition>,
    orders: Vec<OrderRecord>,
    balance: f64,
    rms: PaperRms,
}

/// The simulator. Matching runs either inline (marketable orders at
/// placement) or from `process_pending_orders`, which the engine drives at
/// 1 Hz via `run_matching_loop`.
pub struct PaperBroker {
    state_path: PathBuf,
    bus: EventBus,
    inner: RwLock<PaperInner>,
}

impl PaperBroker {
    pub fn new(starting_balance: f64, base_dir: &Path, bus: EventBus) -> Self {
        let broker = Self {
            state_path: base_dir.join("paper_account.json"),
            bus,
            inner: RwLock::new(PaperInner {
                market_data: HashMap::new(),
                tradingsymbol_to_token: HashMap::new(),
                positions: HashMap::new(),
                orders: Vec::new(),
                balance: starting_balance,
                rms: PaperRms::new(starting_balance),
            }),
        };
        broker.load_state();
        broker.save_state();
        broker
    }

    // -------------------------------------------------------------------------
    // Market data plumbing
    // -------------------------------------------------------------------------

    /// Install tradingsymbol → instrument-token mappings from the loader.
    pub fn set_instrument_map(&self, mappings: HashMap<String, u32>) {
        let mut inner = self.inner.write();
        let count = mappings.len();
        inner.tradingsymbol_to_token.extend(mappings);
        info!(count, "paper broker instrument mappings installed");
    }

    pub fn update_market_data(&self, ticks: &[Tick]) {
        let mut inner = self.inner.write();
        for tick in ticks {
            inner.market_data.insert(tick.instrument_token, tick.clone());
        }
    }

    fn ltp_for(inner: &PaperInner, tradingsymbol: &str) -> Option<f64> {
        let token = inner.tradingsymbol_to_token.get(tradingsymbol)?;
        let tick = inner.market_data.get(token)?;
        (tick.last_price > 0.0).then_some(tick.last_price)
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    fn load_state(&self) {
        let Ok(content) = std::fs::read_to_string(&self.state_path) else {
            return;
        };
        match serde_json::from_str::<PaperState>(&content) {
            Ok(state) => {
                let mut inner = self.inner.write();
                inner.balance = state.balance;
                inner.positions = state.positions;
                inner.rms.used_margin = state.rms_used_margin;
                info!(
                    balance = inner.balance,
                    positions = inner.positions.len(),
                    "paper trading state loaded"
                );
            }
            Err(err) => {
                // Malformed state: log, ignore the file, continue empty.
                warn!(error = %err, path = %self.state_path.display(), "corrupt paper state ignored");
            }
        }
    }

    fn save_state(&self) {
        let serialized = {
            let inner = self.inner.read();
            serde_json::to_string_pretty(&PaperState {
                balance: inner.balance,
                positions: inner.positions.clone(),
                rms_used_margin: inner.rms.used_margin,
            })
        };
        let serialized = match serialized {
            Ok(s) => s,
            Err(err) => {
                error!(error = %err, "could not serialise paper trading state");
                return;
            }
        };
        if let Some(parent) = self.state_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::write(&self.state_path, serialized) {
            error!(error = %err, path = %self.state_path.display(), "could not save paper trading state");
        }
    }

    // -------------------------------------------------------------------------
    // Matching
    // -------------------------------------------------------------------------

    /// One pass of the tick-driven engine over all working orders. Called
    /// from the 1 Hz matching loop.
    pub fn process_pending_orders(&self) {
        let mut fills: Vec<OrderRecord> = Vec::new();

        {
            let inner = &mut *self.inner.write();
            for idx in 0..inner.orders.len() {
                if !inner.orders[idx].status.is_pending() {
                    continue;
                }

                let Some(ltp) = Self::ltp_for(inner, &inner.orders[idx].tradingsymbol.clone())
                else {
                    continue;
                };

                let order_type = inner.orders[idx].order_type;
                let side = inner.orders[idx].transaction_type;
                let status = inner.orders[idx].status;

                match order_type {
                    OrderType::Limit => {
                        let limit = inner.orders[idx].price.unwrap_or(0.0);
                        let marketable = match side {
                            TransactionType::Buy => ltp <= limit,
                            TransactionType::Sell => ltp >= limit,
                        };
                        if marketable {
                            fills.push(Self::execute_trade(inner, idx, ltp));
                        }
                    }
                    OrderType::Sl | OrderType::SlM => {
                        let Some(trigger) = inner.orders[idx].trigger_price else {
                            continue;
                        };
                        let triggered = match side {
                            TransactionType::Sell => ltp <= trigger,
                            TransactionType::Buy => ltp >= trigger,
                        };
                        if triggered {
                            // SL carries a limit price to execute at; SL-M
                            // goes at the trigger itself.
                            let exec_price = if order_type == OrderType::Sl {
                                inner.orders[idx].price.unwrap_or(trigger)
                            } else {
                                trigger
                            };
                            fills.push(Self::execute_trade(inner, idx, exec_price));
                        }
                    }
                    OrderType::Market => {
                        if status == OrderStatus::PendingExecution {
                            fills.push(Self::execute_trade(inner, idx, ltp));
                        }
                    }
                }
            }
        }

        if !fills.is_empty() {
            self.save_state();
            for order in fills {
                info!(
                    order_id = %order.order_id,
                    tradingsymbol = %order.tradingsymbol,
                    price = order.average_price,
                    "paper order executed by tick engine"
                );
                self.bus.publish(EngineEvent::OrderUpdate { order });
            }
        }
    }

    /// Fill `orders[idx]` at `price`, updating position, margin and balance
    /// bookkeeping. Returns the completed order record for event fan-out.
    fn execute_trade(inner: &mut PaperInner, idx: usize, price: f64) -> OrderRecord {
        let tradingsymbol = inner.orders[idx].tradingsymbol.clone();
        let side = inner.orders[idx].transaction_type;
        let total_qty = inner.orders[idx].quantity;
        let product = inner.orders[idx].product;
        let exchange = inner.orders[idx].exchange;
        let group_name = inner.orders[idx].group_name.clone();
        let exchange_timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string();

        let mut qty = total_qty;
        let mut exit_qty: i64 = 0;
        let mut entry_qty: i64 = 0;
        let mut realized: f64 = 0.0;

        // 1. Reduce through any opposite-side position first.
        let mut remove_position = false;
        if let Some(pos) = inner.positions.get_mut(&tradingsymbol) {
            let closes_short = side == TransactionType::Buy && pos.quantity < 0;
            let closes_long = side == TransactionType::Sell && pos.quantity > 0;
            if closes_short || closes_long {
                let close_qty = qty.min(pos.quantity.abs());
                let entry_price = pos.average_price;
                realized = if closes_short {
                    (entry_price - price) * close_qty as f64
                } else {
                    (price - entry_price) * close_qty as f64
                };
                exit_qty = close_qty;
                pos.realized_pnl += realized;
                inner.balance += realized;
                inner.rms.release_margin(entry_price, close_qty);

                pos.quantity += if closes_short { close_qty } else { -close_qty };
                if pos.quantity == 0 {
                    remove_position = true;
                }
                qty -= close_qty;
            }
        }
        if remove_position {
            inner.positions.remove(&tradingsymbol);
        }

        // 2. Any residual quantity opens or extends a same-side position.
        if qty > 0 {
            entry_qty = qty;
            inner.rms.reserve_margin(price, qty);
            let signed_qty = if side == TransactionType::Buy { qty } else { -qty };

            match inner.positions.get_mut(&tradingsymbol) {
                None => {
                    inner.positions.insert(
                        tradingsymbol.clone(),
                        PaperPosition {
                            tradingsymbol: tradingsymbol.clone(),
                            quantity: signed_qty,
                            average_price: price,
                            last_price: price,
                            realized_pnl: 0.0,
                            unrealized_pnl: 0.0,
                            product,
                            exchange,
                            timestamp: exchange_timestamp.clone(),
                            group_name: group_name.clone(),
                        },
                    );
                }
                Some(pos) => {
                    let old_abs = pos.quantity.abs();
                    let new_abs = old_abs + qty;
                    pos.average_price = (pos.average_price * old_abs as f64
                        + price * qty as f64)
                        / new_abs as f64;
                    pos.quantity = if pos.quantity >= 0 { new_abs } else { -new_abs };
                    if group_name.is_some() {
                        pos.group_name = group_name.clone();
                    }
                }
            }
        }

        let order = &mut inner.orders[idx];
        order.status = OrderStatus::Complete;
        order.average_price = price;
        order.filled_quantity = total_qty;
        order.pending_quantity = 0;
        order.exchange_timestamp = Some(exchange_timestamp);
        order.exit_qty = exit_qty;
        order.entry_qty = entry_qty;
        if exit_qty > 0 {
            order.realized_pnl = realized;
        }
        order.clone()
    }

    // -------------------------------------------------------------------------
    // Expiry pruning
    // -------------------------------------------------------------------------

    fn remove_expired_positions(inner: &mut PaperInner) -> usize {
        let today = Local::now().date_naive();
        let expired: Vec<String> = inner
            .positions
            .keys()
            .filter(|symbol| {
                parse_expiry_from_symbol(symbol)
                    .map(|expiry| expiry < today)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        for symbol in &expired {
            inner.positions.remove(symbol);
            info!(tradingsymbol = %symbol, "removed expired paper position");
        }
        expired.len()
    }

    // -------------------------------------------------------------------------
    // Account queries
    // -------------------------------------------------------------------------

    pub fn balance(&self) -> f64 {
        self.inner.read().balance
    }

    pub fn used_margin(&self) -> f64 {
        self.inner.read().rms.used_margin
    }

    pub fn available_margin(&self) -> f64 {
        self.inner.read().rms.available_margin()
    }

    pub fn rms_snapshot(&self) -> Value {
        self.inner.read().rms.snapshot()
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn place_order(&self, args: &BrokerOrderArgs) -> Result<String> {
        let mut events: Vec<EngineEvent> = Vec::new();
        let mut executed = false;

        let result = {
            let inner = &mut *self.inner.write();

            // Resolve a price for margin math: explicit price, else LTP.
            let resolved_price = args
                .price
                .or_else(|| Self::ltp_for(inner, &args.tradingsymbol));
            let Some(price) = resolved_price else {
                let reason = "Price unavailable for margin calculation".to_string();
                warn!(tradingsymbol = %args.tradingsymbol, "paper RMS rejected order: {reason}");
                events.push(EngineEvent::OrderRejected {
                    reason: reason.clone(),
                    tradingsymbol: args.tradingsymbol.clone(),
                    quantity: args.quantity,
                });
                self.publish_all(events);
                anyhow::bail!(reason);
            };

            // Quantity that actually opens exposure (after netting against
            // an opposite-side position) is what the RMS gates.
            let position_qty = inner
                .positions
                .get(&args.tradingsymbol)
                .map(|p| p.quantity)
                .unwrap_or(0);
            let opening_qty = match args.transaction_type {
                TransactionType::Buy if position_qty < 0 => {
                    (args.quantity - position_qty.abs()).max(0)
                }
                TransactionType::Sell if position_qty > 0 => {
                    (args.quantity - position_qty).max(0)
                }
                _ => args.quantity,
            };

            if opening_qty > 0 {
                let (allowed, reason) = inner.rms.can_place_order(price, opening_qty);
                if !allowed {
                    warn!(tradingsymbol = %args.tradingsymbol, "paper RMS rejected order: {reason}");
                    events.push(EngineEvent::OrderRejected {
                        reason: reason.clone(),
                        tradingsymbol: args.tradingsymbol.clone(),
                        quantity: args.quantity,
                    });
                    self.publish_all(events);
                    anyhow::bail!(reason);
                }
            }

            let order_id = format!("paper_{}", Local::now().timestamp_millis());
            let ltp = Self::ltp_for(inner, &args.tradingsymbol).unwrap_or(0.0);

            let mut order = OrderRecord {
                order_id: order_id.clone(),
                tradingsymbol: args.tradingsymbol.clone(),
                transaction_type: args.transaction_type,
                quantity: args.quantity,
                order_type: args.order_type,
                product: args.product,
                exchange: args.exchange,
                status: OrderStatus::Open,
                price: Some(price),
                trigger_price: args.trigger_price,
                order_timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                average_price: 0.0,
                filled_quantity: 0,
                pending_quantity: args.quantity,
                exchange_timestamp: None,
                group_name: args.group_name.clone(),
                entry_qty: 0,
                exit_qty: 0,
                realized_pnl: 0.0,
            };

            info!(
                order_type = %args.order_type,
                side = %args.transaction_type,
                tradingsymbol = %args.tradingsymbol,
                quantity = args.quantity,
                price,
                ltp,
                "placing paper order"
            );

            match args.order_type {
                OrderType::Market => {
                    if ltp > 0.0 {
                        inner.orders.push(order);
                        let idx = inner.orders.len() - 1;
                        let filled = Self::execute_trade(inner, idx, ltp);
                        events.push(EngineEvent::OrderUpdate { order: filled });
                        executed = true;
                    } else {
                        order.status = OrderStatus::PendingExecution;
                        events.push(EngineEvent::OrderUpdate { order: order.clone() });
                        inner.orders.push(order);
                    }
                }
                OrderType::Limit => {
                    let marketable = ltp > 0.0
                        && match args.transaction_type {
                            TransactionType::Buy => price >= ltp,
                            TransactionType::Sell => price <= ltp,
                        };
                    if marketable {
                        inner.orders.push(order);
                        let idx = inner.orders.len() - 1;
                        let filled = Self::execute_trade(inner, idx, ltp);
                        events.push(EngineEvent::OrderUpdate { order: filled });
                        executed = true;
                    } else {
                        order.status = OrderStatus::TriggerPending;
                        events.push(EngineEvent::OrderUpdate { order: order.clone() });
                        inner.orders.push(order);
                    }
                }
                OrderType::Sl | OrderType::SlM => {
                    // Protective orders never execute at placement.
                    order.status = OrderStatus::TriggerPending;
                    events.push(EngineEvent::OrderUpdate { order: order.clone() });
                    inner.orders.push(order);
                }
            }

            Ok(order_id)
        };

        if executed {
            self.save_state();
        }
        self.publish_all(events);
        result
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let cancelled = {
            let mut inner = self.inner.write();
            inner
                .orders
                .iter_mut()
                .find(|o| o.order_id == order_id && o.status.is_pending())
                .map(|order| {
                    order.status = OrderStatus::Cancelled;
                    order.clone()
                })
        };

        match cancelled {
            Some(order) => {
                info!(order_id, "paper order cancelled");
                self.bus.publish(EngineEvent::OrderUpdate { order });
                Ok(())
            }
            None => anyhow::bail!("could not find cancellable paper order with id {order_id}"),
        }
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>> {
        let (positions, pruned) = {
            let inner = &mut *self.inner.write();
            let pruned = Self::remove_expired_positions(inner);

            let tokens: Vec<(String, Option<f64>)> = inner
                .positions
                .keys()
                .map(|s| (s.clone(), Self::ltp_for(inner, s)))
                .collect();
            for (symbol, ltp) in tokens {
                if let (Some(pos), Some(ltp)) = (inner.positions.get_mut(&symbol), ltp) {
                    pos.last_price = ltp;
                    pos.unrealized_pnl = (ltp - pos.average_price) * pos.quantity as f64;
                }
            }

            let snapshot: Vec<BrokerPosition> = inner
                .positions
                .values()
                .map(|pos| BrokerPosition {
                    tradingsymbol: pos.tradingsymbol.clone(),
                    quantity: pos.quantity,
                    average_price: pos.average_price,
                    last_price: pos.last_price,
                    pnl: pos.unrealized_pnl,
                    realized_pnl: pos.realized_pnl,
                    instrument_token: inner
                        .tradingsymbol_to_token
                        .get(&pos.tradingsymbol)
                        .copied()
                        .unwrap_or(0),
                    product: pos.product,
                    exchange: pos.exchange,
                    group_name: pos.group_name.clone(),
                })
                .collect();
            (snapshot, pruned)
        };

        if pruned > 0 {
            self.save_state();
        }
        Ok(positions)
    }

    async fn orders(&self) -> Result<Vec<OrderRecord>> {
        Ok(self.inner.read().orders.clone())
    }

    async fn profile(&self) -> Result<Value> {
        Ok(json!({ "user_id": "PAPER" }))
    }

    async fn margins(&self) -> Result<Value> {
        let inner = self.inner.read();
        let available = inner.rms.available_margin();
        let used = inner.rms.used_margin;
        Ok(json!({
            "equity": {
                "available": { "live_balance": available },
                "utilised": { "total": used },
                "net": available + used,
            }
        }))
    }
}

impl PaperBroker {
    fn publish_all(&self, events: Vec<EngineEvent>) {
        for event in events {
            self.bus.publish(event);
        }
    }
}

impl std::fmt::Debug for PaperBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PaperBroker")
            .field("balance", &inner.balance)
            .field("positions", &inner.positions.len())
            .field("orders", &inner.orders.len())
            .finish()
    }
}

/// Run the 1 Hz matching tick forever. Spawn once at engine startup.
pub async fn run_matching_loop(broker: std::sync::Arc<PaperBroker>) {
    info!(interval_secs = MATCHING_INTERVAL_SECS, "paper matching loop started");
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(MATCHING_INTERVAL_SECS));
    loop {
        ticker.tick().await;
        broker.process_pending_orders();
    }
}

// ---------------------------------------------------------------------------
// Expiry parsing
// ---------------------------------------------------------------------------

const MONTH_CODES: [(&str, u32); 12] = [
    ("JAN", 1),
    ("FEB", 2),
    ("MAR", 3),
    ("APR", 4),
    ("MAY", 5),
    ("JUN", 6),
    ("JUL", 7),
    ("AUG", 8),
    ("SEP", 9),
    ("OCT", 10),
    ("NOV", 11),
    ("DEC", 12),
];

/// Derive an expiry date from a tradingsymbol. Monthly contracts carry
/// `YY<MMM>` (expiry = month end); weeklies a 5-digit `YYMDD` run. Returns
/// `None` when neither pattern is present.
pub fn parse_expiry_from_symbol(symbol: &str) -> Option<NaiveDate> {
    let bytes = symbol.as_bytes();

    // Monthly: two digits immediately followed by a month code.
    for (code, month) in MONTH_CODES {
        if let Some(pos) = symbol.find(code) {
            if pos >= 2 && bytes[pos - 1].is_ascii_digit() && bytes[pos - 2].is_ascii_digit() {
                let year: i32 = 2000 + symbol[pos - 2..pos].parse::<i32>().ok()?;
                return Some(month_end(year, month));
            }
        }
    }

    // Weekly: five consecutive digits — YY, single-digit month, DD.
    let mut run_start = None;
    let mut run_len = 0;
    for (i, b) in bytes.iter().enumerate() {
        if b.is_ascii_digit() {
            if run_len == 0 {
                run_start = Some(i);
            }
            run_len += 1;
            if run_len == 5 {
                let start = run_start?;
                let digits = &symbol[start..start + 5];
                let year: i32 = 2000 + digits[0..2].parse::<i32>().ok()?;
                let month: u32 = digits[2..3].parse().ok()?;
                let day: u32 = digits[3..5].parse().ok()?;
                return NaiveDate::from_ymd_opt(year, month, day);
            }
        } else {
            run_len = 0;
        }
    }

    None
}

fn month_end(year: i32, month: u32) -> NaiveDate {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    first_of_next
        .and_then(|d| d.pred_opt())
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, month, 28).unwrap())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Exchange, ProductType};

    fn tick(token: u32, price: f64) -> Tick {
        Tick {
            instrument_token: token,
            last_price: price,
            bid: price - 0.05,
            ask: price + 0.05,
            oi: 0.0,
            timestamp: None,
        }
    }

    fn broker(dir: &Path) -> PaperBroker {
        let broker = PaperBroker::new(DEFAULT_STARTING_BALANCE, dir, EventBus::new());
        broker.set_instrument_map(HashMap::from([("NIFTY30DEC24500CE".to_string(), 256265u32)]));
        broker.update_market_data(&[tick(256265, 120.0)]);
        broker
    }

    fn args(
        side: TransactionType,
        qty: i64,
        order_type: OrderType,
        price: Option<f64>,
        trigger: Option<f64>,
    ) -> BrokerOrderArgs {
        BrokerOrderArgs {
            exchange: Exchange::Nfo,
            tradingsymbol: "NIFTY30DEC24500CE".into(),
            transaction_type: side,
            quantity: qty,
            product: ProductType::Mis,
            order_type,
            price,
            trigger_price: trigger,
            group_name: None,
        }
    }

    #[tokio::test]
    async fn market_order_fills_immediately_at_ltp() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(dir.path());

        broker
            .place_order(&args(TransactionType::Buy, 50, OrderType::Market, None, None))
            .await
            .unwrap();

        let positions = broker.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 50);
        assert!((positions[0].average_price - 120.0).abs() < 1e-9);

        // Margin reserved at fill price with the 1.1 factor.
        assert!((broker.used_margin() - 120.0 * 50.0 * 1.1).abs() < 1e-6);

        let orders = broker.orders().await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Complete);
        assert_eq!(orders[0].entry_qty, 50);
        assert_eq!(orders[0].exit_qty, 0);
    }

    #[tokio::test]
    async fn market_order_without_ltp_waits_for_tick_engine() {
        let dir = tempfile::tempdir().unwrap();
        let broker = PaperBroker::new(DEFAULT_STARTING_BALANCE, dir.path(), EventBus::new());
        broker.set_instrument_map(HashMap::from([("NIFTY30DEC24500CE".to_string(), 256265u32)]));

        // A price is still needed for margin, so pass one explicitly.
        broker
            .place_order(&args(TransactionType::Buy, 50, OrderType::Market, Some(120.0), None))
            .await
            .unwrap();
        assert_eq!(broker.orders().await.unwrap()[0].status, OrderStatus::PendingExecution);

        broker.update_market_data(&[tick(256265, 121.0)]);
        broker.process_pending_orders();

        let orders = broker.orders().await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Complete);
        assert!((orders[0].average_price - 121.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn limit_buy_below_market_parks_then_fills_on_dip() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(dir.path());

        broker
            .place_order(&args(TransactionType::Buy, 50, OrderType::Limit, Some(118.0), None))
            .await
            .unwrap();
        assert_eq!(broker.orders().await.unwrap()[0].status, OrderStatus::TriggerPending);

        // Still above the limit: nothing happens.
        broker.update_market_data(&[tick(256265, 119.0)]);
        broker.process_pending_orders();
        assert_eq!(broker.orders().await.unwrap()[0].status, OrderStatus::TriggerPending);

        // Dip through the limit: fill at LTP (better than limit).
        broker.update_market_data(&[tick(256265, 117.5)]);
        broker.process_pending_orders();
        let orders = broker.orders().await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Complete);
        assert!((orders[0].average_price - 117.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn marketable_limit_buy_fills_at_ltp_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(dir.path());

        broker
            .place_order(&args(TransactionType::Buy, 50, OrderType::Limit, Some(121.0), None))
            .await
            .unwrap();
        let orders = broker.orders().await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Complete);
        assert!((orders[0].average_price - 120.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn slm_sell_triggers_as_protective_long_stop() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(dir.path());

        // Long 50 first.
        broker
            .place_order(&args(TransactionType::Buy, 50, OrderType::Market, None, None))
            .await
            .unwrap();

        // SL-M sell with trigger below market NEVER fills at placement.
        broker
            .place_order(&args(TransactionType::Sell, 50, OrderType::SlM, None, Some(115.0)))
            .await
            .unwrap();
        let orders = broker.orders().await.unwrap();
        assert_eq!(orders[1].status, OrderStatus::TriggerPending);

        // Price above trigger: untouched.
        broker.update_market_data(&[tick(256265, 118.0)]);
        broker.process_pending_orders();
        assert_eq!(broker.orders().await.unwrap()[1].status, OrderStatus::TriggerPending);

        // Breach: executes at the trigger price and closes the long.
        broker.update_market_data(&[tick(256265, 114.0)]);
        broker.process_pending_orders();
        let orders = broker.orders().await.unwrap();
        assert_eq!(orders[1].status, OrderStatus::Complete);
        assert!((orders[1].average_price - 115.0).abs() < 1e-9);
        assert_eq!(orders[1].exit_qty, 50);
        assert!((orders[1].realized_pnl - (115.0 - 120.0) * 50.0).abs() < 1e-9);
        assert!(broker.positions().await.unwrap().is_empty());
        assert!(broker.used_margin().abs() < 1e-6);
    }

    #[tokio::test]
    async fn buy_covers_short_then_opens_long_with_residual() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(dir.path());

        // Short 50 @ 120.
        broker
            .place_order(&args(TransactionType::Sell, 50, OrderType::Market, None, None))
            .await
            .unwrap();
        assert_eq!(broker.positions().await.unwrap()[0].quantity, -50);

        // Buy 80 @ 118: cover 50 (pnl +100), open long 30.
        broker.update_market_data(&[tick(256265, 118.0)]);
        broker
            .place_order(&args(TransactionType::Buy, 80, OrderType::Market, None, None))
            .await
            .unwrap();

        let positions = broker.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 30);
        assert!((positions[0].average_price - 118.0).abs() < 1e-9);

        let orders = broker.orders().await.unwrap();
        let cover = &orders[1];
        assert_eq!(cover.exit_qty, 50);
        assert_eq!(cover.entry_qty, 30);
        assert!((cover.realized_pnl - (120.0 - 118.0) * 50.0).abs() < 1e-9);

        // Balance grew by the realised pnl.
        assert!((broker.balance() - (DEFAULT_STARTING_BALANCE + 100.0)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn averaging_extends_position_with_weighted_mean() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(dir.path());

        broker
            .place_order(&args(TransactionType::Buy, 50, OrderType::Market, None, None))
            .await
            .unwrap();
        broker.update_market_data(&[tick(256265, 130.0)]);
        broker
            .place_order(&args(TransactionType::Buy, 50, OrderType::Market, None, None))
            .await
            .unwrap();

        let positions = broker.positions().await.unwrap();
        assert_eq!(positions[0].quantity, 100);
        assert!((positions[0].average_price - 125.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rms_rejection_emits_event_and_error() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let broker = PaperBroker::new(10_000.0, dir.path(), bus);
        broker.set_instrument_map(HashMap::from([("NIFTY30DEC24500CE".to_string(), 256265u32)]));
        broker.update_market_data(&[tick(256265, 120.0)]);

        let err = broker
            .place_order(&args(TransactionType::Buy, 500, OrderType::Market, None, None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Insufficient margin"));

        match rx.recv().await.unwrap() {
            EngineEvent::OrderRejected { reason, tradingsymbol, quantity } => {
                assert!(reason.contains("Insufficient margin"));
                assert_eq!(tradingsymbol, "NIFTY30DEC24500CE");
                assert_eq!(quantity, 500);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reducing_order_is_not_margin_gated() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let broker = PaperBroker::new(10_000.0, dir.path(), bus);
        broker.set_instrument_map(HashMap::from([("NIFTY30DEC24500CE".to_string(), 256265u32)]));
        broker.update_market_data(&[tick(256265, 100.0)]);

        // 10000 balance carries 90 units at 100 (9900 margin).
        broker
            .place_order(&args(TransactionType::Buy, 90, OrderType::Market, None, None))
            .await
            .unwrap();

        // A full exit needs no fresh margin even though the account is
        // nearly exhausted.
        broker
            .place_order(&args(TransactionType::Sell, 90, OrderType::Market, None, None))
            .await
            .unwrap();
        assert!(broker.positions().await.unwrap().is_empty());
        assert!(broker.used_margin().abs() < 1e-6);
    }

    #[tokio::test]
    async fn cancel_only_touches_pending_orders() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(dir.path());

        let pending_id = broker
            .place_order(&args(TransactionType::Buy, 50, OrderType::Limit, Some(110.0), None))
            .await
            .unwrap();
        broker.cancel_order(&pending_id).await.unwrap();
        assert_eq!(broker.orders().await.unwrap()[0].status, OrderStatus::Cancelled);

        // Cancelling again fails: no longer pending.
        assert!(broker.cancel_order(&pending_id).await.is_err());
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let broker = broker(dir.path());
            broker
                .place_order(&args(TransactionType::Buy, 50, OrderType::Market, None, None))
                .await
                .unwrap();
        }

        let revived = PaperBroker::new(DEFAULT_STARTING_BALANCE, dir.path(), EventBus::new());
        revived.set_instrument_map(HashMap::from([("NIFTY30DEC24500CE".to_string(), 256265u32)]));
        let positions = revived.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 50);
        assert!((revived.used_margin() - 120.0 * 50.0 * 1.1).abs() < 1e-6);
    }

    #[tokio::test]
    async fn corrupt_state_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("paper_account.json"), b"{not json").unwrap();

        let broker = PaperBroker::new(DEFAULT_STARTING_BALANCE, dir.path(), EventBus::new());
        assert!((broker.balance() - DEFAULT_STARTING_BALANCE).abs() < 1e-9);
        assert!(broker.positions().await.unwrap().is_empty());
    }

    #[test]
    fn expiry_parsing_monthly_and_weekly() {
        // Monthly: 24DEC → 2024-12-31.
        assert_eq!(
            parse_expiry_from_symbol("NIFTY24DECFUT"),
            Some(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap())
        );
        // Weekly: 24709 → 2024-07-09 (5-digit run, strike follows after).
        assert_eq!(
            parse_expiry_from_symbol("NIFTY24709"),
            Some(NaiveDate::from_ymd_opt(2024, 7, 9).unwrap())
        );
        assert_eq!(parse_expiry_from_symbol("RELIANCE"), None);
    }

    #[tokio::test]
    async fn expired_positions_pruned_on_positions_call() {
        let dir = tempfile::tempdir().unwrap();
        let broker = PaperBroker::new(DEFAULT_STARTING_BALANCE, dir.path(), EventBus::new());

        {
            let mut inner = broker.inner.write();
            inner.positions.insert(
                "NIFTY20JAN10000CE".to_string(),
                PaperPosition {
                    tradingsymbol: "NIFTY20JAN10000CE".to_string(),
                    quantity: 50,
                    average_price: 100.0,
                    last_price: 100.0,
                    realized_pnl: 0.0,
                    unrealized_pnl: 0.0,
                    product: ProductType::Mis,
                    exchange: Exchange::Nfo,
                    timestamp: String::new(),
                    group_name: None,
                },
            );
        }

        // Jan 2020 expired long ago.
        assert!(broker.positions().await.unwrap().is_empty());
    }
}

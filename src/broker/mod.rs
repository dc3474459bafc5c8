// =============================================================================
// Broker abstraction — one trait, two implementations (live REST and the
// paper simulator)
// =============================================================================
//
// The underlying live SDK is single-threaded: callers must not issue
// concurrent `positions()` / `orders()` / `place_order()` against one client.
// The engine serialises refreshes behind the position manager's gate and
// executes orders from a single task, so the constraint holds by
// construction. Every live call is bounded by `BROKER_CALL_TIMEOUT`.
// =============================================================================

pub mod kite;
pub mod rate_limit;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    Exchange, OrderStatus, OrderType, PendingOrder, ProductType, TransactionType,
};

pub use kite::KiteBrokerClient;
pub use rate_limit::RateLimitTracker;

/// Per-call timeout on broker API calls.
pub const BROKER_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Order variety used everywhere; AMO/iceberg varieties are not routed by
/// this desk.
pub const VARIETY_REGULAR: &str = "regular";

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// Arguments for a single broker order. `price` is only meaningful for
/// LIMIT/SL, `trigger_price` for SL/SL-M.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderArgs {
    pub exchange: Exchange,
    pub tradingsymbol: String,
    pub transaction_type: TransactionType,
    pub quantity: i64,
    pub product: ProductType,
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub trigger_price: Option<f64>,
    #[serde(default)]
    pub group_name: Option<String>,
}

/// One row of the broker's net-position book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub tradingsymbol: String,
    pub quantity: i64,
    #[serde(default)]
    pub average_price: f64,
    #[serde(default)]
    pub last_price: f64,
    #[serde(default)]
    pub pnl: f64,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub instrument_token: u32,
    #[serde(default)]
    pub product: ProductType,
    #[serde(default)]
    pub exchange: Exchange,
    #[serde(default)]
    pub group_name: Option<String>,
}

/// Full order record as surfaced by `orders()`. The paper simulator also
/// uses this as its internal order storage, so fills annotate the record
/// with entry/exit bookkeeping that drives ledger recording upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub tradingsymbol: String,
    pub transaction_type: TransactionType,
    pub quantity: i64,
    pub order_type: OrderType,
    pub product: ProductType,
    pub exchange: Exchange,
    pub status: OrderStatus,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub trigger_price: Option<f64>,
    #[serde(default)]
    pub order_timestamp: String,
    #[serde(default)]
    pub average_price: f64,
    #[serde(default)]
    pub filled_quantity: i64,
    #[serde(default)]
    pub pending_quantity: i64,
    #[serde(default)]
    pub exchange_timestamp: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    /// Quantity that opened (or extended) a position in this fill.
    #[serde(default)]
    pub entry_qty: i64,
    /// Quantity that closed against an opposite position in this fill.
    #[serde(default)]
    pub exit_qty: i64,
    /// Realised PnL attributable to the closing part of this fill.
    #[serde(default)]
    pub realized_pnl: f64,
}

impl OrderRecord {
    pub fn to_pending(&self) -> PendingOrder {
        PendingOrder {
            order_id: self.order_id.clone(),
            tradingsymbol: self.tradingsymbol.clone(),
            transaction_type: self.transaction_type,
            quantity: self.quantity,
            pending_quantity: if self.pending_quantity > 0 {
                self.pending_quantity
            } else {
                self.quantity - self.filled_quantity
            },
            price: self.price.unwrap_or(0.0),
            trigger_price: self.trigger_price.unwrap_or(0.0),
            status: self.status,
            product: self.product,
            exchange: self.exchange,
        }
    }
}

// ---------------------------------------------------------------------------
// The trait
// ---------------------------------------------------------------------------

/// The broker surface the engine depends on. Mirrors the live client's
/// duck-typed contract so the paper simulator is a drop-in replacement.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Submit an order; returns the broker order id.
    async fn place_order(&self, args: &BrokerOrderArgs) -> anyhow::Result<String>;

    /// Cancel a working order.
    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<()>;

    /// Net positions book.
    async fn positions(&self) -> anyhow::Result<Vec<BrokerPosition>>;

    /// All of today's orders (any status).
    async fn orders(&self) -> anyhow::Result<Vec<OrderRecord>>;

    /// Account profile; at minimum `user_id`.
    async fn profile(&self) -> anyhow::Result<Value>;

    /// Margin structure (`equity` / `commodity` segments).
    async fn margins(&self) -> anyhow::Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_record_to_pending_derives_pending_quantity() {
        let record = OrderRecord {
            order_id: "ord_1".into(),
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
            filled_quantity: 20,
            pending_quantity: 0,
            exchange_timestamp: None,
            group_name: None,
            entry_qty: 0,
            exit_qty: 0,
            realized_pnl: 0.0,
        };

        let pending = record.to_pending();
        assert_eq!(pending.pending_quantity, 30);
        assert!((pending.price - 120.0).abs() < f64::EPSILON);
        assert_eq!(pending.status, OrderStatus::Open);
    }
}

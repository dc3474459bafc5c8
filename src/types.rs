// =============================================================================
// Shared types used across the Vega desk engine
// =============================================================================
//
// Wire strings follow the broker API exactly ("BUY", "SL-M", "TRIGGER PENDING"
// and friends) so serialised orders and positions round-trip without mapping
// tables at the transport boundary.
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Order / position enums
// ---------------------------------------------------------------------------

/// Order side as the broker expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// The side that closes a position of this side.
    pub fn inverse(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker order types. `Sl` carries a limit price alongside the trigger,
/// `SlM` executes at market once triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "SL")]
    Sl,
    #[serde(rename = "SL-M")]
    SlM,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::Sl => "SL",
            Self::SlM => "SL-M",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductType {
    #[serde(rename = "MIS")]
    Mis,
    #[serde(rename = "NRML")]
    Nrml,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mis => "MIS",
            Self::Nrml => "NRML",
        }
    }
}

impl Default for ProductType {
    fn default() -> Self {
        Self::Mis
    }
}

impl std::fmt::Display for ProductType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Exchange {
    #[serde(rename = "NFO")]
    Nfo,
    #[serde(rename = "NSE")]
    Nse,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nfo => "NFO",
            Self::Nse => "NSE",
        }
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::Nfo
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker-side order lifecycle states we care about. The three "pending"
/// states are the ones the position manager tracks as open orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "TRIGGER PENDING")]
    TriggerPending,
    #[serde(rename = "AMO REQ RECEIVED")]
    AmoReqReceived,
    #[serde(rename = "PENDING_EXECUTION")]
    PendingExecution,
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "REJECTED")]
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::TriggerPending => "TRIGGER PENDING",
            Self::AmoReqReceived => "AMO REQ RECEIVED",
            Self::PendingExecution => "PENDING_EXECUTION",
            Self::Complete => "COMPLETE",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
        }
    }

    /// True for states where the order is still working at the broker and
    /// may still fill (or be cancelled).
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::Open | Self::TriggerPending | Self::AmoReqReceived | Self::PendingExecution
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Option type of a contract. FUT/EQ round out the instrument universe so
/// the ledger can record non-option trades too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
    #[serde(rename = "FUT")]
    Future,
    #[serde(rename = "EQ")]
    Equity,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "CE",
            Self::Put => "PE",
            Self::Future => "FUT",
            Self::Equity => "EQ",
        }
    }
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the engine routes orders to the live broker or the paper
/// simulator. Lowercase form suffixes persisted file names, uppercase form
/// goes into ledger rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    #[serde(rename = "live")]
    Live,
    #[serde(rename = "paper")]
    Paper,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Paper => "paper",
        }
    }

    pub fn as_upper(&self) -> &'static str {
        match self {
            Self::Live => "LIVE",
            Self::Paper => "PAPER",
        }
    }
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Immutable instrument descriptor. Created by the instrument loader,
/// referenced by positions and orders. Quote fields are the last values seen
/// when the snapshot was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    pub tradingsymbol: String,
    pub instrument_token: u32,
    #[serde(default = "default_lot_size")]
    pub lot_size: i64,
    #[serde(default)]
    pub strike: f64,
    pub option_type: OptionType,
    pub expiry: Option<NaiveDate>,
    #[serde(default)]
    pub ltp: f64,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
    #[serde(default)]
    pub oi: f64,
}

fn default_lot_size() -> i64 {
    1
}

impl Contract {
    /// Placeholder contract for a position whose instrument metadata is
    /// unavailable. Real-time PnL will not update for it.
    pub fn unknown(tradingsymbol: &str, instrument_token: u32) -> Self {
        Self {
            symbol: tradingsymbol.to_string(),
            tradingsymbol: tradingsymbol.to_string(),
            instrument_token,
            lot_size: 1,
            strike: 0.0,
            option_type: OptionType::Equity,
            expiry: None,
            ltp: 0.0,
            bid: 0.0,
            ask: 0.0,
            oi: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Market tick
// ---------------------------------------------------------------------------

/// A single market data tick as fanned out to consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub instrument_token: u32,
    pub last_price: f64,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
    #[serde(default)]
    pub oi: f64,
    /// Exchange timestamp, unix seconds. Absent on synthetic ticks.
    #[serde(default)]
    pub timestamp: Option<f64>,
}

// ---------------------------------------------------------------------------
// Pending order
// ---------------------------------------------------------------------------

/// Broker-side open or trigger-pending order, as surfaced by `orders()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub order_id: String,
    pub tradingsymbol: String,
    pub transaction_type: TransactionType,
    pub quantity: i64,
    #[serde(default)]
    pub pending_quantity: i64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub trigger_price: f64,
    pub status: OrderStatus,
    pub product: ProductType,
    pub exchange: Exchange,
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// A live holding tracked by the position manager. Quantity is signed:
/// positive long, negative short. A tracked position never has quantity 0 —
/// on reaching 0 the entry is removed and a removal event fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub tradingsymbol: String,
    pub quantity: i64,
    pub average_price: f64,
    pub ltp: f64,
    pub pnl: f64,
    pub product: ProductType,
    pub exchange: Exchange,
    pub contract: Contract,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub stop_loss_order_id: Option<String>,
    #[serde(default)]
    pub target_order_id: Option<String>,
    #[serde(default)]
    pub stop_loss_price: Option<f64>,
    #[serde(default)]
    pub target_price: Option<f64>,
    /// Absolute trailing offset; the effective stop only ever tightens.
    #[serde(default)]
    pub trailing_stop_loss: Option<f64>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub entry_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Set while an exit order is in flight so the monitor skips the symbol.
    #[serde(default)]
    pub is_exiting: bool,
    /// True only during the refresh cycle that first saw the position.
    #[serde(default)]
    pub is_new: bool,
    #[serde(default = "default_trade_status")]
    pub trade_status: String,
    #[serde(default = "default_strategy_name")]
    pub strategy_name: String,
}

fn default_trade_status() -> String {
    "MANUAL".to_string()
}

fn default_strategy_name() -> String {
    "N/A".to_string()
}

impl Position {
    pub fn is_long(&self) -> bool {
        self.quantity > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_strings_match_broker_contract() {
        assert_eq!(TransactionType::Buy.as_str(), "BUY");
        assert_eq!(OrderType::SlM.as_str(), "SL-M");
        assert_eq!(OrderStatus::TriggerPending.as_str(), "TRIGGER PENDING");
        assert_eq!(OrderStatus::AmoReqReceived.as_str(), "AMO REQ RECEIVED");
        assert_eq!(ProductType::Mis.as_str(), "MIS");
        assert_eq!(Exchange::Nfo.as_str(), "NFO");
    }

    #[test]
    fn order_status_serde_roundtrip() {
        let json = serde_json::to_string(&OrderStatus::TriggerPending).unwrap();
        assert_eq!(json, "\"TRIGGER PENDING\"");
        let back: OrderStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, OrderStatus::TriggerPending);
    }

    #[test]
    fn pending_states_classified() {
        assert!(OrderStatus::Open.is_pending());
        assert!(OrderStatus::TriggerPending.is_pending());
        assert!(OrderStatus::AmoReqReceived.is_pending());
        assert!(OrderStatus::PendingExecution.is_pending());
        assert!(!OrderStatus::Complete.is_pending());
        assert!(!OrderStatus::Cancelled.is_pending());
    }

    #[test]
    fn transaction_type_inverse() {
        assert_eq!(TransactionType::Buy.inverse(), TransactionType::Sell);
        assert_eq!(TransactionType::Sell.inverse(), TransactionType::Buy);
    }

    #[test]
    fn trading_mode_forms() {
        assert_eq!(TradingMode::Paper.as_str(), "paper");
        assert_eq!(TradingMode::Live.as_upper(), "LIVE");
        assert_eq!(TradingMode::default(), TradingMode::Paper);
    }
}

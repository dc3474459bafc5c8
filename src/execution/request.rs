// =============================================================================
// Execution request — the parent-order intent handed to the stack
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{OrderType, ProductType, TransactionType};

/// How aggressively the parent order wants liquidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Normal,
    High,
}

impl Default for Urgency {
    fn default() -> Self {
        Self::Normal
    }
}

/// Child-order scheduling algorithm. IMMEDIATE and IS place the full size in
/// one shot; the schedule algos slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionAlgo {
    #[serde(rename = "IMMEDIATE")]
    Immediate,
    #[serde(rename = "TWAP")]
    Twap,
    #[serde(rename = "VWAP")]
    Vwap,
    #[serde(rename = "POV")]
    Pov,
    #[serde(rename = "IS")]
    Is,
}

impl ExecutionAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "IMMEDIATE",
            Self::Twap => "TWAP",
            Self::Vwap => "VWAP",
            Self::Pov => "POV",
            Self::Is => "IS",
        }
    }

    /// Whether the algo schedules multiple child slices.
    pub fn is_sliced(&self) -> bool {
        matches!(self, Self::Twap | Self::Vwap | Self::Pov)
    }
}

impl Default for ExecutionAlgo {
    fn default() -> Self {
        Self::Immediate
    }
}

impl std::fmt::Display for ExecutionAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue positioning chosen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePriority {
    Neutral,
    Take,
    Join,
}

impl QueuePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::Take => "take",
            Self::Join => "join",
        }
    }
}

/// The router's verdict for a parent order.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub route: &'static str,
    pub queue_priority: QueuePriority,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
}

/// Parent-order intent. Metadata carries source, auto-token, signal id and
/// risk context through to the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub tradingsymbol: String,
    pub transaction_type: TransactionType,
    pub quantity: i64,
    pub order_type: OrderType,
    pub product: ProductType,
    pub ltp: f64,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default = "default_participation_rate")]
    pub participation_rate: f64,
    #[serde(default)]
    pub execution_algo: ExecutionAlgo,
    #[serde(default = "default_max_child_orders")]
    pub max_child_orders: i64,
    #[serde(default = "default_randomize_slices")]
    pub randomize_slices: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_participation_rate() -> f64 {
    0.15
}

fn default_max_child_orders() -> i64 {
    1
}

fn default_randomize_slices() -> bool {
    true
}

impl ExecutionRequest {
    /// A plain immediate request; callers tune the remaining fields.
    pub fn new(
        tradingsymbol: impl Into<String>,
        transaction_type: TransactionType,
        quantity: i64,
        order_type: OrderType,
        product: ProductType,
        ltp: f64,
    ) -> Self {
        Self {
            tradingsymbol: tradingsymbol.into(),
            transaction_type,
            quantity,
            order_type,
            product,
            ltp,
            bid: 0.0,
            ask: 0.0,
            limit_price: None,
            urgency: Urgency::Normal,
            participation_rate: default_participation_rate(),
            execution_algo: ExecutionAlgo::Immediate,
            max_child_orders: default_max_child_orders(),
            randomize_slices: default_randomize_slices(),
            metadata: Map::new(),
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_on_deserialise() {
        let json = r#"{
            "tradingsymbol": "NIFTY24DEC24500CE",
            "transaction_type": "BUY",
            "quantity": 50,
            "order_type": "MARKET",
            "product": "MIS",
            "ltp": 120.0
        }"#;
        let req: ExecutionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.execution_algo, ExecutionAlgo::Immediate);
        assert_eq!(req.urgency, Urgency::Normal);
        assert_eq!(req.max_child_orders, 1);
        assert!(req.randomize_slices);
        assert!((req.participation_rate - 0.15).abs() < f64::EPSILON);
    }

    #[test]
    fn sliced_algos_classified() {
        assert!(ExecutionAlgo::Twap.is_sliced());
        assert!(ExecutionAlgo::Vwap.is_sliced());
        assert!(ExecutionAlgo::Pov.is_sliced());
        assert!(!ExecutionAlgo::Immediate.is_sliced());
        assert!(!ExecutionAlgo::Is.is_sliced());
    }
}

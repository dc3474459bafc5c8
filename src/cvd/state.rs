// =============================================================================
// CVD automation records + durable state file
// =============================================================================
//
// The per-token trade records are tagged structs rather than loose maps, but
// unknown fields are preserved through `#[serde(flatten)]` so a newer build
// can read state written by an older one and vice versa.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::types::{ProductType, TradingMode, TransactionType};

/// Fallback stop distance (underlying points) when neither the signal nor
/// the chart state provides one.
pub const DEFAULT_STOPLOSS_POINTS: f64 = 50.0;
/// Default ATR trailing step.
pub const DEFAULT_ATR_TRAILING_STEP_POINTS: f64 = 10.0;

/// Strategies that participate in max-profit-giveback by default.
pub fn default_giveback_strategies() -> Vec<String> {
    vec![
        "atr_reversal".to_string(),
        "ema_cross".to_string(),
        "atr_divergence".to_string(),
        "range_breakout".to_string(),
    ]
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSide {
    Long,
    Short,
}

impl SignalSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }
}

impl std::fmt::Display for SignalSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    AtrReversal,
    AtrDivergence,
    EmaCross,
    RangeBreakout,
    OpenDrive,
    CvdRangeBreakout,
}

impl StrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AtrReversal => "atr_reversal",
            Self::AtrDivergence => "atr_divergence",
            Self::EmaCross => "ema_cross",
            Self::RangeBreakout => "range_breakout",
            Self::OpenDrive => "open_drive",
            Self::CvdRangeBreakout => "cvd_range_breakout",
        }
    }

    /// Reversal pecking order: an opposite-side signal only displaces an
    /// active trade when its priority is strictly higher. Strategies outside
    /// the table never displace anything.
    pub fn priority(&self) -> u8 {
        match self {
            Self::AtrReversal => 1,
            Self::AtrDivergence => 2,
            Self::EmaCross => 3,
            Self::RangeBreakout => 4,
            Self::OpenDrive | Self::CvdRangeBreakout => 0,
        }
    }

    /// Map a raw signal-type label onto a strategy, defaulting to
    /// atr_reversal for anything unrecognised.
    pub fn from_signal_type(signal_type: Option<&str>) -> Self {
        match signal_type {
            Some("ema_cvd_cross") | Some("ema_cross") => Self::EmaCross,
            Some("atr_divergence") => Self::AtrDivergence,
            Some("range_breakout") => Self::RangeBreakout,
            Some("open_drive") => Self::OpenDrive,
            Some("cvd_range_breakout") => Self::CvdRangeBreakout,
            _ => Self::AtrReversal,
        }
    }
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How entries are executed: through the multi-strike panel plan or as a
/// single ATM strike order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    BuyExitPanel,
    SingleStrike,
}

impl Default for Route {
    fn default() -> Self {
        Self::BuyExitPanel
    }
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

/// An entry signal from a CVD chart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CvdSignal {
    pub instrument_token: u32,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub signal_side: Option<SignalSide>,
    #[serde(default)]
    pub signal_type: Option<String>,
    #[serde(default)]
    pub route: Option<Route>,
    #[serde(default)]
    pub price_close: Option<f64>,
    #[serde(default)]
    pub stoploss_points: Option<f64>,
    #[serde(default)]
    pub max_profit_giveback_points: Option<f64>,
    #[serde(default)]
    pub max_profit_giveback_strategies: Option<Vec<String>>,
}

/// Per-bar market state for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketStateFrame {
    pub instrument_token: u32,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub price_close: f64,
    #[serde(default)]
    pub ema10: f64,
    #[serde(default)]
    pub ema51: f64,
    #[serde(default)]
    pub cvd_close: f64,
    #[serde(default)]
    pub cvd_ema10: f64,
    #[serde(default)]
    pub cvd_ema51: f64,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub signal_filter: Option<String>,
    #[serde(default)]
    pub route: Option<Route>,
    #[serde(default)]
    pub stoploss_points: Option<f64>,
    #[serde(default)]
    pub max_profit_giveback_points: Option<f64>,
    #[serde(default)]
    pub max_profit_giveback_strategies: Option<Vec<String>>,
    /// Anything the chart sends that this build does not model yet.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// The per-token trade record
// ---------------------------------------------------------------------------

/// Active automation trade for one instrument token. Persisted verbatim, so
/// every field is defaulted and unknown fields ride along in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationTrade {
    pub tradingsymbol: String,
    #[serde(default)]
    pub tradingsymbols: Vec<String>,
    pub signal_side: SignalSide,
    #[serde(default)]
    pub route: Route,
    #[serde(default)]
    pub signal_timestamp: Option<String>,
    #[serde(default = "default_strategy")]
    pub strategy_type: StrategyType,
    #[serde(default)]
    pub stoploss_points: f64,
    #[serde(default)]
    pub max_profit_giveback_points: f64,
    #[serde(default = "default_giveback_strategies")]
    pub max_profit_giveback_strategies: Vec<String>,
    #[serde(default = "default_atr_step")]
    pub atr_trailing_step_points: f64,
    #[serde(default)]
    pub entry_underlying: f64,
    #[serde(default)]
    pub max_favorable_points: f64,
    #[serde(default)]
    pub sl_underlying: Option<f64>,
    #[serde(default)]
    pub last_price_close: Option<f64>,
    #[serde(default)]
    pub last_ema10: Option<f64>,
    #[serde(default)]
    pub last_ema51: Option<f64>,
    #[serde(default)]
    pub last_cvd_close: Option<f64>,
    #[serde(default)]
    pub last_cvd_ema10: Option<f64>,
    #[serde(default)]
    pub last_cvd_ema51: Option<f64>,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub product: ProductType,
    #[serde(default = "default_transaction_type")]
    pub transaction_type: TransactionType,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub pending_retry_attempts: u32,
    #[serde(default)]
    pub pending_retry_disabled: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_strategy() -> StrategyType {
    StrategyType::AtrReversal
}

fn default_atr_step() -> f64 {
    DEFAULT_ATR_TRAILING_STEP_POINTS
}

fn default_transaction_type() -> TransactionType {
    TransactionType::Buy
}

impl AutomationTrade {
    /// The symbols this trade tracks (multi-strike entries track several).
    pub fn tracked_symbols(&self) -> Vec<String> {
        if self.tradingsymbols.is_empty() {
            vec![self.tradingsymbol.clone()]
        } else {
            self.tradingsymbols.clone()
        }
    }

    pub fn giveback_applies(&self) -> bool {
        self.max_profit_giveback_points > 0.0
            && self
                .max_profit_giveback_strategies
                .iter()
                .any(|s| s == self.strategy_type.as_str())
    }
}

// ---------------------------------------------------------------------------
// Durable store
// ---------------------------------------------------------------------------

/// Serialises the automation positions map to
/// `cvd_automation_state_<mode>.json`. Loading drops malformed entries
/// without failing: a corrupt record must never take the coordinator down.
pub struct CvdStateStore {
    path: PathBuf,
    trading_mode: TradingMode,
}

impl CvdStateStore {
    pub fn new(trading_mode: TradingMode, base_dir: &Path) -> Self {
        Self {
            path: base_dir.join(format!("cvd_automation_state_{trading_mode}.json")),
            trading_mode,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, positions: &HashMap<u32, AutomationTrade>) {
        let serialisable: Map<String, Value> = positions
            .iter()
            .filter(|(_, trade)| !trade.tradingsymbol.trim().is_empty())
            .filter_map(|(token, trade)| {
                serde_json::to_value(trade)
                    .ok()
                    .map(|v| (token.to_string(), v))
            })
            .collect();

        let payload = serde_json::json!({
            "saved_at": chrono::Local::now().to_rfc3339(),
            "trading_mode": self.trading_mode,
            "positions": serialisable,
        });

        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&self.path, serde_json::to_string_pretty(&payload)?)
        };
        if let Err(err) = write() {
            error!(error = %err, path = %self.path.display(), "failed to persist CVD automation state");
        }
    }

    pub fn load(&self) -> HashMap<u32, AutomationTrade> {
        let mut positions = HashMap::new();
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return positions;
        };

        let parsed: Value = match serde_json::from_str(&content) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(error = %err, path = %self.path.display(), "failed to load CVD automation state");
                return positions;
            }
        };

        let Some(entries) = parsed.get("positions").and_then(Value::as_object) else {
            return positions;
        };

        for (token_raw, value) in entries {
            let Ok(token) = token_raw.parse::<u32>() else {
                warn!(token = %token_raw, "dropping CVD state entry with bad token");
                continue;
            };
            match serde_json::from_value::<AutomationTrade>(value.clone()) {
                Ok(trade) if !trade.tradingsymbol.trim().is_empty() => {
                    positions.insert(token, trade);
                }
                Ok(_) => {
                    warn!(token, "dropping CVD state entry without tradingsymbol");
                }
                Err(err) => {
                    warn!(token, error = %err, "dropping malformed CVD state entry");
                }
            }
        }

        info!(
            count = positions.len(),
            path = %self.path.display(),
            "CVD automation state loaded"
        );
        positions
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trade(symbol: &str, side: SignalSide) -> AutomationTrade {
        AutomationTrade {
            tradingsymbol: symbol.to_string(),
            tradingsymbols: vec![symbol.to_string()],
            signal_side: side,
            route: Route::SingleStrike,
            signal_timestamp: Some("2024-12-20T10:15:00+05:30".to_string()),
            strategy_type: StrategyType::AtrReversal,
            stoploss_points: 50.0,
            max_profit_giveback_points: 100.0,
            max_profit_giveback_strategies: default_giveback_strategies(),
            atr_trailing_step_points: 10.0,
            entry_underlying: 24500.0,
            max_favorable_points: 0.0,
            sl_underlying: Some(24450.0),
            last_price_close: Some(24500.0),
            last_ema10: None,
            last_ema51: None,
            last_cvd_close: None,
            last_cvd_ema10: None,
            last_cvd_ema51: None,
            quantity: 50,
            product: ProductType::Mis,
            transaction_type: TransactionType::Buy,
            group_name: "CVD_AUTO_256265".to_string(),
            pending_retry_attempts: 0,
            pending_retry_disabled: false,
            extra: Map::new(),
        }
    }

    #[test]
    fn strategy_priority_order() {
        assert!(StrategyType::AtrDivergence.priority() > StrategyType::AtrReversal.priority());
        assert!(StrategyType::EmaCross.priority() > StrategyType::AtrDivergence.priority());
        assert!(StrategyType::RangeBreakout.priority() > StrategyType::EmaCross.priority());
        assert_eq!(StrategyType::OpenDrive.priority(), 0);
    }

    #[test]
    fn signal_type_mapping_defaults_to_atr_reversal() {
        assert_eq!(
            StrategyType::from_signal_type(Some("ema_cvd_cross")),
            StrategyType::EmaCross
        );
        assert_eq!(
            StrategyType::from_signal_type(Some("range_breakout")),
            StrategyType::RangeBreakout
        );
        assert_eq!(StrategyType::from_signal_type(Some("???")), StrategyType::AtrReversal);
        assert_eq!(StrategyType::from_signal_type(None), StrategyType::AtrReversal);
    }

    #[test]
    fn state_roundtrip_is_fixpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CvdStateStore::new(TradingMode::Paper, dir.path());

        let mut positions = HashMap::new();
        positions.insert(256265u32, trade("NIFTY24DEC24500CE", SignalSide::Long));
        positions.insert(260105u32, trade("BANKNIFTY24DEC52000PE", SignalSide::Short));
        store.save(&positions);

        let loaded = store.load();
        assert_eq!(loaded.len(), 2);
        let t = &loaded[&256265];
        assert_eq!(t.tradingsymbol, "NIFTY24DEC24500CE");
        assert_eq!(t.signal_side, SignalSide::Long);
        assert_eq!(t.sl_underlying, Some(24450.0));
        assert_eq!(
            t.signal_timestamp.as_deref(),
            Some("2024-12-20T10:15:00+05:30")
        );

        // Save → load → save is stable.
        store.save(&loaded);
        let again = store.load();
        assert_eq!(again.len(), 2);
        assert_eq!(again[&260105].tradingsymbol, "BANKNIFTY24DEC52000PE");
    }

    #[test]
    fn load_drops_malformed_entries_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CvdStateStore::new(TradingMode::Paper, dir.path());

        let raw = serde_json::json!({
            "saved_at": "2024-12-20T10:00:00",
            "trading_mode": "paper",
            "positions": {
                "256265": serde_json::to_value(trade("NIFTY24DEC24500CE", SignalSide::Long)).unwrap(),
                "not_a_token": serde_json::to_value(trade("X", SignalSide::Long)).unwrap(),
                "111": "not a dict",
                "222": { "signal_side": "long" },
            }
        });
        std::fs::write(store.path(), serde_json::to_string(&raw).unwrap()).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&256265));
    }

    #[test]
    fn unknown_fields_survive_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CvdStateStore::new(TradingMode::Live, dir.path());

        let mut t = trade("NIFTY24DEC24500CE", SignalSide::Long);
        t.extra
            .insert("future_field".to_string(), serde_json::json!({"nested": 1}));
        let mut positions = HashMap::new();
        positions.insert(1u32, t);
        store.save(&positions);

        let loaded = store.load();
        assert_eq!(loaded[&1].extra["future_field"]["nested"], serde_json::json!(1));
    }

    #[test]
    fn entries_without_symbol_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = CvdStateStore::new(TradingMode::Paper, dir.path());

        let mut blank = trade("", SignalSide::Long);
        blank.tradingsymbols.clear();
        let mut positions = HashMap::new();
        positions.insert(1u32, blank);
        positions.insert(2u32, trade("NIFTY24DEC24500CE", SignalSide::Long));
        store.save(&positions);

        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&2));
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CvdStateStore::new(TradingMode::Paper, dir.path());
        assert!(store.load().is_empty());
    }

    #[test]
    fn giveback_applies_only_to_listed_strategies() {
        let mut t = trade("NIFTY24DEC24500CE", SignalSide::Long);
        assert!(t.giveback_applies());

        t.max_profit_giveback_strategies = vec!["ema_cross".to_string()];
        assert!(!t.giveback_applies());

        t.max_profit_giveback_points = 0.0;
        t.max_profit_giveback_strategies = default_giveback_strategies();
        assert!(!t.giveback_applies());
    }
}

// =============================================================================
// Settings — Hot-reloadable engine configuration with atomic save
// =============================================================================
//
// Every tunable lives here so the engine can be reconfigured at runtime
// without a restart. Persistence uses an atomic tmp + rename pattern to
// prevent corruption on crash. All fields carry `#[serde(default)]` so that
// adding new fields never breaks loading an older settings file.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{ProductType, TradingMode};

/// Directory under the user's home where every persisted file lives.
const APP_DIR_NAME: &str = ".vega_desk";

/// Resolve the runtime data directory (`~/.vega_desk`), falling back to the
/// current directory when HOME is unset (e.g. stripped-down containers).
pub fn default_base_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "NIFTY".to_string()
}

fn default_lots() -> i64 {
    1
}

fn default_starting_paper_balance() -> f64 {
    1_000_000.0
}

fn default_bind_addr() -> String {
    "127.0.0.1:3801".to_string()
}

fn default_refresh_interval_secs() -> u64 {
    5
}

fn default_risk_eval_interval_secs() -> u64 {
    5
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level runtime settings for the Vega desk engine.
///
/// Risk limits follow the "0 means disabled" convention throughout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Live broker vs paper simulator routing.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Product used when an order does not specify one.
    #[serde(default)]
    pub default_product: ProductType,

    /// Underlying symbol the desk trades by default.
    #[serde(default = "default_symbol")]
    pub default_symbol: String,

    /// Lot multiplier applied to automation entries.
    #[serde(default = "default_lots")]
    pub default_lots: i64,

    // --- Risk limits (rupees / counts; 0 disables the check) -----------------

    /// Kill-switch trigger: drawdown from the intraday peak PnL.
    #[serde(default)]
    pub risk_intraday_drawdown_limit: f64,

    /// Kill-switch trigger: absolute intraday loss.
    #[serde(default)]
    pub risk_max_portfolio_loss: f64,

    /// Pre-trade gate: maximum distinct open symbols.
    #[serde(default)]
    pub risk_max_open_positions: i64,

    /// Pre-trade gate: maximum gross open quantity across all positions.
    #[serde(default)]
    pub risk_max_gross_open_quantity: i64,

    // --- Engine plumbing ------------------------------------------------------

    /// Paper account starting balance.
    #[serde(default = "default_starting_paper_balance")]
    pub starting_paper_balance: f64,

    /// Control API bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Position refresh cadence, seconds.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Risk lock evaluation cadence, seconds.
    #[serde(default = "default_risk_eval_interval_secs")]
    pub risk_eval_interval_secs: u64,

    /// Override for the runtime data directory. Empty = `~/.vega_desk`.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paper,
            default_product: ProductType::Mis,
            default_symbol: default_symbol(),
            default_lots: default_lots(),
            risk_intraday_drawdown_limit: 0.0,
            risk_max_portfolio_loss: 0.0,
            risk_max_open_positions: 0,
            risk_max_gross_open_quantity: 0,
            starting_paper_balance: default_starting_paper_balance(),
            bind_addr: default_bind_addr(),
            refresh_interval_secs: default_refresh_interval_secs(),
            risk_eval_interval_secs: default_risk_eval_interval_secs(),
            base_dir: None,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;

        info!(
            path = %path.display(),
            trading_mode = %settings.trading_mode,
            "settings loaded"
        );

        Ok(settings)
    }

    /// Persist settings to `path` using an atomic write (write to `.tmp`,
    /// then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise settings to JSON")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        info!(path = %path.display(), "settings saved (atomic)");
        Ok(())
    }

    /// Effective runtime data directory.
    pub fn resolved_base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(default_base_dir)
    }
}

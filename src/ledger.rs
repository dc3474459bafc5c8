// =============================================================================
// Trade Ledger — single source of truth for all completed trades
// =============================================================================
//
// Rules:
//   - a trade is recorded ONLY after its exit order is COMPLETE;
//   - realised PnL is final and never recalculated;
//   - all performance metrics read from here.
//
// Live and paper trades live in separate database files
// (`trades_live.db` / `trades_paper.db`). `order_id_exit` is UNIQUE; a
// duplicate insert is logged and skipped so replayed fill events stay
// idempotent.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::TradingMode;

/// One closed-trade row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub order_id_entry: Option<String>,
    pub order_id_exit: String,
    pub symbol: String,
    pub tradingsymbol: String,
    pub instrument_token: i64,
    pub option_type: String,
    /// ISO date, e.g. "2024-12-26".
    pub expiry: Option<String>,
    pub strike: f64,
    /// "LONG" or "SHORT".
    pub side: String,
    pub quantity: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: String,
    pub exit_time: String,
    pub realized_pnl: f64,
    pub charges: f64,
    pub net_pnl: f64,
    pub exit_reason: Option<String>,
    pub strategy_tag: Option<String>,
    /// "MANUAL" or "ALGO".
    pub trade_status: String,
    pub strategy_name: String,
    pub trading_mode: String,
    /// Local calendar date of the session, ISO format.
    pub session_date: String,
}

/// Aggregate day statistics.
#[derive(Debug, Clone, Serialize)]
pub struct DayStats {
    pub total_trades: i64,
    pub wins: i64,
    pub losses: i64,
    pub win_rate: f64,
    pub total_pnl: f64,
}

/// Richer summary used by the performance view.
#[derive(Debug, Clone, Serialize)]
pub struct DaySummary {
    pub total_trades: i64,
    pub wins: i64,
    pub losses: i64,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub best_trade: f64,
}

pub struct TradeLedger {
    mode: TradingMode,
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl TradeLedger {
    pub fn new(mode: TradingMode, base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir)
            .with_context(|| format!("failed to create {}", base_dir.display()))?;
        let db_path = base_dir.join(format!("trades_{mode}.db"));

        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open trade ledger at {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;

             CREATE TABLE IF NOT EXISTS trades (
                 trade_id            TEXT PRIMARY KEY,
                 order_id_entry      TEXT,
                 order_id_exit       TEXT UNIQUE,

                 symbol              TEXT,
                 tradingsymbol       TEXT,
                 instrument_token    INTEGER,
                 option_type         TEXT,
                 expiry              DATE,
                 strike              REAL,

                 side                TEXT,
                 quantity            INTEGER,

                 entry_price         REAL,
                 exit_price          REAL,

                 entry_time          TEXT,
                 exit_time           TEXT,

                 realized_pnl        REAL,
                 charges             REAL DEFAULT 0,
                 net_pnl             REAL,

                 exit_reason         TEXT,
                 strategy_tag        TEXT,
                 trade_status        TEXT DEFAULT 'MANUAL',
                 strategy_name       TEXT DEFAULT 'N/A',

                 trading_mode        TEXT,
                 session_date        DATE,

                 created_at          TEXT DEFAULT CURRENT_TIMESTAMP
             );

             CREATE INDEX IF NOT EXISTS idx_trades_session_date
                 ON trades(session_date);",
        )
        .context("failed to create trade ledger schema")?;

        info!(mode = %mode.as_upper(), path = %db_path.display(), "trade ledger initialised");

        Ok(Self {
            mode,
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // -------------------------------------------------------------------------
    // Write API
    // -------------------------------------------------------------------------

    /// Insert a finalised trade. Returns `Ok(false)` when the row already
    /// exists (duplicate `order_id_exit`), which is not an error.
    pub fn record_trade(&self, trade: &TradeRecord) -> Result<bool> {
        let session_date = if trade.session_date.is_empty() {
            Local::now().date_naive().to_string()
        } else {
            trade.session_date.clone()
        };
        let trade_status = if trade.trade_status.is_empty() {
            "MANUAL".to_string()
        } else {
            trade.trade_status.to_uppercase()
        };
        let strategy_name = if trade.strategy_name.is_empty() {
            trade.strategy_tag.clone().unwrap_or_else(|| "N/A".to_string())
        } else {
            trade.strategy_name.clone()
        };

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO trades (
                 trade_id, order_id_entry, order_id_exit,
                 symbol, tradingsymbol, instrument_token, option_type, expiry, strike,
                 side, quantity,
                 entry_price, exit_price, entry_time, exit_time,
                 realized_pnl, charges, net_pnl,
                 exit_reason, strategy_tag, trade_status, strategy_name,
                 trading_mode, session_date
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                       ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            params![
                trade.trade_id,
                trade.order_id_entry,
                trade.order_id_exit,
                trade.symbol,
                trade.tradingsymbol,
                trade.instrument_token,
                trade.option_type,
                trade.expiry,
                trade.strike,
                trade.side,
                trade.quantity,
                trade.entry_price,
                trade.exit_price,
                trade.entry_time,
                trade.exit_time,
                trade.realized_pnl,
                trade.charges,
                trade.net_pnl,
                trade.exit_reason,
                trade.strategy_tag,
                trade_status,
                strategy_name,
                // Force consistency with this ledger's mode.
                self.mode.as_upper(),
                session_date,
            ],
        );

        match result {
            Ok(_) => {
                info!(
                    mode = %self.mode.as_upper(),
                    tradingsymbol = %trade.tradingsymbol,
                    net_pnl = trade.net_pnl,
                    "trade recorded"
                );
                Ok(true)
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                warn!(
                    mode = %self.mode.as_upper(),
                    order_id_exit = %trade.order_id_exit,
                    "duplicate trade ignored"
                );
                Ok(false)
            }
            Err(err) => Err(err).with_context(|| {
                format!(
                    "failed to record trade for {} (order_id_exit={})",
                    trade.tradingsymbol, trade.order_id_exit
                )
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Read APIs
    // -------------------------------------------------------------------------

    pub fn get_trades_for_date(&self, session_date: &str) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trade_id, order_id_entry, order_id_exit, symbol, tradingsymbol,
                    instrument_token, option_type, expiry, strike, side, quantity,
                    entry_price, exit_price, entry_time, exit_time, realized_pnl,
                    charges, net_pnl, exit_reason, strategy_tag, trade_status,
                    strategy_name, trading_mode, session_date
             FROM trades WHERE session_date = ?1 ORDER BY exit_time ASC",
        )?;
        let rows = stmt
            .query_map(params![session_date], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_realized_pnl_for_date(&self, session_date: &str) -> Result<f64> {
        let conn = self.conn.lock();
        let pnl: f64 = conn.query_row(
            "SELECT COALESCE(SUM(net_pnl), 0) FROM trades WHERE session_date = ?1",
            params![session_date],
            |row| row.get(0),
        )?;
        Ok(pnl)
    }

    pub fn get_daily_trade_stats(&self, session_date: &str) -> Result<DayStats> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT
                 COUNT(*),
                 COALESCE(SUM(CASE WHEN net_pnl > 0 THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN net_pnl <= 0 THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(net_pnl), 0)
             FROM trades WHERE session_date = ?1",
            params![session_date],
            |row| {
                let total: i64 = row.get(0)?;
                let wins: i64 = row.get(1)?;
                Ok(DayStats {
                    total_trades: total,
                    wins,
                    losses: row.get(2)?,
                    win_rate: if total > 0 {
                        wins as f64 / total as f64 * 100.0
                    } else {
                        0.0
                    },
                    total_pnl: row.get(3)?,
                })
            },
        )
        .context("failed to read daily trade stats")
    }

    pub fn get_day_summary(&self, session_date: &str) -> Result<DaySummary> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT
                 COUNT(*),
                 COALESCE(SUM(net_pnl), 0),
                 COALESCE(SUM(CASE WHEN net_pnl > 0 THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN net_pnl < 0 THEN 1 ELSE 0 END), 0),
                 COALESCE(MAX(net_pnl), 0),
                 COALESCE(AVG(CASE WHEN net_pnl > 0 THEN net_pnl END), 0),
                 COALESCE(AVG(CASE WHEN net_pnl < 0 THEN net_pnl END), 0)
             FROM trades WHERE session_date = ?1",
            params![session_date],
            |row| {
                let total: i64 = row.get(0)?;
                let wins: i64 = row.get(2)?;
                Ok(DaySummary {
                    total_trades: total,
                    total_pnl: row.get(1)?,
                    wins,
                    losses: row.get(3)?,
                    best_trade: row.get(4)?,
                    avg_win: row.get(5)?,
                    avg_loss: row.get(6)?,
                    win_rate: if total > 0 {
                        (wins as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
                    } else {
                        0.0
                    },
                })
            },
        )
        .context("failed to read day summary")
    }

    pub fn get_last_n_trades(&self, n: i64) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trade_id, order_id_entry, order_id_exit, symbol, tradingsymbol,
                    instrument_token, option_type, expiry, strike, side, quantity,
                    entry_price, exit_price, entry_time, exit_time, realized_pnl,
                    charges, net_pnl, exit_reason, strategy_tag, trade_status,
                    strategy_name, trading_mode, session_date
             FROM trades ORDER BY exit_time DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![n], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn row_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))?;
        Ok(count)
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRecord> {
        Ok(TradeRecord {
            trade_id: row.get(0)?,
            order_id_entry: row.get(1)?,
            order_id_exit: row.get(2)?,
            symbol: row.get(3)?,
            tradingsymbol: row.get(4)?,
            instrument_token: row.get(5)?,
            option_type: row.get(6)?,
            expiry: row.get(7)?,
            strike: row.get(8)?,
            side: row.get(9)?,
            quantity: row.get(10)?,
            entry_price: row.get(11)?,
            exit_price: row.get(12)?,
            entry_time: row.get(13)?,
            exit_time: row.get(14)?,
            realized_pnl: row.get(15)?,
            charges: row.get(16)?,
            net_pnl: row.get(17)?,
            exit_reason: row.get(18)?,
            strategy_tag: row.get(19)?,
            trade_status: row.get(20)?,
            strategy_name: row.get(21)?,
            trading_mode: row.get(22)?,
            session_date: row.get(23)?,
        })
    }
}

impl std::fmt::Debug for TradeLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeLedger")
            .field("mode", &self.mode)
            .field("db_path", &self.db_path)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trade(order_id_exit: &str, net_pnl: f64, session_date: &str) -> TradeRecord {
        TradeRecord {
            trade_id: format!("trade_{order_id_exit}"),
            order_id_entry: Some("entry_1".to_string()),
            order_id_exit: order_id_exit.to_string(),
            symbol: "NIFTY".to_string(),
            tradingsymbol: "NIFTY24DEC24500CE".to_string(),
            instrument_token: 256265,
            option_type: "CE".to_string(),
            expiry: Some("2024-12-26".to_string()),
            strike: 24500.0,
            side: "LONG".to_string(),
            quantity: 50,
            entry_price: 120.0,
            exit_price: 120.0 + net_pnl / 50.0,
            entry_time: "2024-12-20T10:00:00".to_string(),
            exit_time: "2024-12-20T11:00:00".to_string(),
            realized_pnl: net_pnl,
            charges: 0.0,
            net_pnl,
            exit_reason: Some("AUTO_SL".to_string()),
            strategy_tag: Some("atr_reversal".to_string()),
            trade_status: "ALGO".to_string(),
            strategy_name: "atr_reversal".to_string(),
            trading_mode: String::new(),
            session_date: session_date.to_string(),
        }
    }

    #[test]
    fn records_and_reads_back_trades() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(TradingMode::Paper, dir.path()).unwrap();

        assert!(ledger.record_trade(&trade("exit_1", 500.0, "2024-12-20")).unwrap());
        assert!(ledger.record_trade(&trade("exit_2", -200.0, "2024-12-20")).unwrap());

        let trades = ledger.get_trades_for_date("2024-12-20").unwrap();
        assert_eq!(trades.len(), 2);
        // The ledger stamps its own mode, uppercase.
        assert!(trades.iter().all(|t| t.trading_mode == "PAPER"));
        assert_eq!(ledger.row_count().unwrap(), 2);
    }

    #[test]
    fn duplicate_exit_order_is_skipped_not_errored() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(TradingMode::Paper, dir.path()).unwrap();

        assert!(ledger.record_trade(&trade("exit_1", 500.0, "2024-12-20")).unwrap());
        let mut dup = trade("exit_1", 999.0, "2024-12-20");
        dup.trade_id = "different_trade_id".to_string();
        assert!(!ledger.record_trade(&dup).unwrap());

        // The original row survives untouched.
        let trades = ledger.get_trades_for_date("2024-12-20").unwrap();
        assert_eq!(trades.len(), 1);
        assert!((trades[0].net_pnl - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn realized_pnl_sums_by_session_date() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(TradingMode::Live, dir.path()).unwrap();

        ledger.record_trade(&trade("e1", 500.0, "2024-12-20")).unwrap();
        ledger.record_trade(&trade("e2", -200.0, "2024-12-20")).unwrap();
        ledger.record_trade(&trade("e3", 1000.0, "2024-12-21")).unwrap();

        assert!((ledger.get_realized_pnl_for_date("2024-12-20").unwrap() - 300.0).abs() < 1e-9);
        assert!((ledger.get_realized_pnl_for_date("2024-12-21").unwrap() - 1000.0).abs() < 1e-9);
        assert_eq!(ledger.get_realized_pnl_for_date("2024-12-22").unwrap(), 0.0);
    }

    #[test]
    fn daily_stats_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(TradingMode::Paper, dir.path()).unwrap();

        ledger.record_trade(&trade("e1", 500.0, "2024-12-20")).unwrap();
        ledger.record_trade(&trade("e2", 300.0, "2024-12-20")).unwrap();
        ledger.record_trade(&trade("e3", -200.0, "2024-12-20")).unwrap();

        let stats = ledger.get_daily_trade_stats("2024-12-20").unwrap();
        assert_eq!(stats.total_trades, 3);
        assert_eq!(stats.wins, 2);
        assert_eq!(stats.losses, 1);
        assert!((stats.total_pnl - 600.0).abs() < 1e-9);

        let summary = ledger.get_day_summary("2024-12-20").unwrap();
        assert!((summary.best_trade - 500.0).abs() < 1e-9);
        assert!((summary.avg_win - 400.0).abs() < 1e-9);
        assert!((summary.avg_loss + 200.0).abs() < 1e-9);
        assert!((summary.win_rate - 66.67).abs() < 0.01);
    }

    #[test]
    fn empty_day_yields_zeroed_stats() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(TradingMode::Paper, dir.path()).unwrap();
        let stats = ledger.get_daily_trade_stats("2030-01-01").unwrap();
        assert_eq!(stats.total_trades, 0);
        assert_eq!(stats.win_rate, 0.0);
    }

    #[test]
    fn last_n_trades_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(TradingMode::Paper, dir.path()).unwrap();

        for i in 0..5 {
            let mut t = trade(&format!("e{i}"), 100.0, "2024-12-20");
            t.exit_time = format!("2024-12-20T1{i}:00:00");
            ledger.record_trade(&t).unwrap();
        }

        let last = ledger.get_last_n_trades(3).unwrap();
        assert_eq!(last.len(), 3);
        assert_eq!(last[0].order_id_exit, "e4");
        assert_eq!(last[2].order_id_exit, "e2");
    }

    #[test]
    fn blank_session_date_defaults_to_today() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(TradingMode::Paper, dir.path()).unwrap();

        let mut t = trade("e1", 100.0, "");
        t.session_date = String::new();
        ledger.record_trade(&t).unwrap();

        let today = Local::now().date_naive().to_string();
        assert_eq!(ledger.get_trades_for_date(&today).unwrap().len(), 1);
    }

    #[test]
    fn separate_files_per_mode() {
        let dir = tempfile::tempdir().unwrap();
        let paper = TradeLedger::new(TradingMode::Paper, dir.path()).unwrap();
        let live = TradeLedger::new(TradingMode::Live, dir.path()).unwrap();

        paper.record_trade(&trade("e1", 100.0, "2024-12-20")).unwrap();
        assert_eq!(paper.row_count().unwrap(), 1);
        assert_eq!(live.row_count().unwrap(), 0);
        assert_ne!(paper.db_path(), live.db_path());
    }
}

// =============================================================================
// Telemetry — in-memory rolling dashboard + TCA report generation
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::error;

use crate::journal::{unix_now, utc_now_iso, ExecutionJournal};
use crate::types::TradingMode;

/// Events retained in the rolling window.
const MAX_EVENTS: usize = 2000;
/// Events included in a persisted snapshot.
const SNAPSHOT_RECENT: usize = 50;

// ---------------------------------------------------------------------------
// Dashboard
// ---------------------------------------------------------------------------

struct DashboardInner {
    events: VecDeque<Map<String, Value>>,
    counters: HashMap<String, u64>,
}

/// In-memory rolling counters with a periodically persisted snapshot for
/// operations tooling.
pub struct TelemetryDashboard {
    path: PathBuf,
    inner: Mutex<DashboardInner>,
}

impl TelemetryDashboard {
    pub fn new(trading_mode: TradingMode, base_dir: &Path) -> Self {
        Self {
            path: base_dir.join(format!("telemetry_snapshot_{trading_mode}.json")),
            inner: Mutex::new(DashboardInner {
                events: VecDeque::with_capacity(MAX_EVENTS),
                counters: HashMap::new(),
            }),
        }
    }

    /// Record one observation. Payload fields are kept alongside the event
    /// type and a unix timestamp.
    pub fn observe(&self, event_type: &str, payload: &Map<String, Value>) {
        let mut entry = Map::new();
        entry.insert("event_type".into(), json!(event_type));
        entry.insert("ts".into(), json!(unix_now()));
        for (k, v) in payload {
            entry.insert(k.clone(), v.clone());
        }

        let mut inner = self.inner.lock();
        if inner.events.len() == MAX_EVENTS {
            inner.events.pop_front();
        }
        inner.events.push_back(entry);
        *inner.counters.entry(event_type.to_string()).or_insert(0) += 1;
    }

    pub fn counter(&self, event_type: &str) -> u64 {
        self.inner.lock().counters.get(event_type).copied().unwrap_or(0)
    }

    /// Serialisable snapshot: all counters plus the tail of the event window.
    pub fn snapshot(&self) -> Value {
        let inner = self.inner.lock();
        let recent: Vec<Value> = inner
            .events
            .iter()
            .rev()
            .take(SNAPSHOT_RECENT)
            .rev()
            .cloned()
            .map(Value::Object)
            .collect();
        json!({
            "generated_at": utc_now_iso(),
            "counters": inner.counters,
            "recent_events": recent,
        })
    }

    /// Overwrite the snapshot file. Failures are logged, never raised.
    pub fn persist(&self) {
        let snap = self.snapshot();
        if let Err(err) = write_json(&self.path, &snap) {
            error!(error = %err, path = %self.path.display(), "failed to persist telemetry snapshot");
        }
    }
}

impl std::fmt::Debug for TelemetryDashboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TelemetryDashboard")
            .field("events", &inner.events.len())
            .field("counters", &inner.counters.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TCA reporter
// ---------------------------------------------------------------------------

/// Builds periodic post-trade execution attribution reports from journal
/// records.
pub struct TcaReporter {
    path: PathBuf,
}

impl TcaReporter {
    pub fn new(trading_mode: TradingMode, base_dir: &Path) -> Self {
        Self {
            path: base_dir.join(format!("tca_report_{trading_mode}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Regenerate the report from the journal. A missing journal is not an
    /// error — there is simply nothing to report yet.
    pub fn generate(&self, journal: &ExecutionJournal) {
        let rows = journal.read_entries();
        if rows.is_empty() && !journal.path().exists() {
            return;
        }

        let of_type = |t: &str| -> Vec<&Map<String, Value>> {
            rows.iter()
                .filter(|r| r.get("event_type").and_then(Value::as_str) == Some(t))
                .collect()
        };

        let placements = of_type("order_placed");
        let rejects = of_type("order_error");
        let fills = of_type("order_fill");
        let exits = of_type("position_exit");
        let incidents = of_type("incident");
        let stuck = incidents
            .iter()
            .filter(|r| r.get("incident").and_then(Value::as_str) == Some("stuck_order"))
            .count();

        let f64_field = |r: &Map<String, Value>, key: &str| -> f64 {
            r.get(key).and_then(Value::as_f64).unwrap_or(0.0)
        };

        let avg_latency = round4(
            placements.iter().map(|p| f64_field(p, "latency_ms")).sum::<f64>()
                / placements.len().max(1) as f64,
        );
        let avg_slippage = round4(
            placements
                .iter()
                .map(|p| f64_field(p, "expected_slippage"))
                .sum::<f64>()
                / placements.len().max(1) as f64,
        );
        let wins = exits
            .iter()
            .filter(|e| {
                e.get("outcome")
                    .and_then(Value::as_str)
                    .map(|o| o.eq_ignore_ascii_case("win"))
                    .unwrap_or(false)
            })
            .count();
        let hit_ratio = round2(wins as f64 / exits.len().max(1) as f64 * 100.0);
        let fill_rate = round2(fills.len() as f64 / placements.len().max(1) as f64 * 100.0);
        let reject_rate = round2(
            rejects.len() as f64 / (placements.len() + rejects.len()).max(1) as f64 * 100.0,
        );

        let report = json!({
            "generated_at": utc_now_iso(),
            "orders_placed": placements.len(),
            "orders_filled": fills.len(),
            "fill_rate_pct": fill_rate,
            "orders_rejected": rejects.len(),
            "reject_rate_pct": reject_rate,
            "avg_latency_ms": avg_latency,
            "avg_expected_slippage": avg_slippage,
            "hit_ratio_pct": hit_ratio,
            "total_incidents": incidents.len(),
            "stuck_order_incidents": stuck,
        });

        if let Err(err) = write_json(&self.path, &report) {
            error!(error = %err, path = %self.path.display(), "failed to write TCA report");
        }
    }
}

fn write_json(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

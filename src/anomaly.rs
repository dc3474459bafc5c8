// =============================================================================
// Anomaly detection — stale ticks, stuck orders, duplicate signals, runaway
// loops — and playbook-driven incident response
// =============================================================================
//
// The detector is surveillance only: it never returns errors and never
// touches broker state itself. Remediation goes through caller-supplied
// hooks; every hook invocation is journalled whether it succeeds or fails.
//
// Stuck-order handling:
//   - `created_at` is set once at submission and NEVER reset, so order age
//     keeps growing until a fill/cancel callback arrives.
//   - Alerts fire from 20 s of age with a 300 s per-order cooldown.
//   - At 600 s without a callback the order is auto-evicted and an
//     `order_evicted` event is journalled; it can no longer alert.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::events::{EngineEvent, EventBus};
use crate::journal::{unix_now, ExecutionJournal};

/// Seconds without a tick before a symbol is considered stale.
pub const DEFAULT_STALE_TICK_SECONDS: f64 = 10.0;
/// Events within the trailing second that indicate a runaway loop.
pub const DEFAULT_LOOP_THRESHOLD: usize = 80;
/// Window for duplicate-signal suppression.
const DUPLICATE_SIGNAL_WINDOW_SECONDS: f64 = 30.0;
/// Minimum order age before a stuck alert may fire.
const STUCK_ORDER_MIN_AGE_SECONDS: f64 = 20.0;
/// Re-alert at most once per this many seconds per order.
const STUCK_ORDER_ALERT_COOLDOWN_SECONDS: f64 = 300.0;
/// Auto-evict from surveillance after this many seconds without a callback.
const STUCK_ORDER_MAX_AGE_SECONDS: f64 = 600.0;
/// Bounded event-timestamp window for loop detection.
const LOOP_WINDOW_CAPACITY: usize = 200;

// ---------------------------------------------------------------------------
// Incident model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    StuckOrder,
    StaleTick,
    DuplicateSignal,
    RunawayLoop,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StuckOrder => "stuck_order",
            Self::StaleTick => "stale_tick",
            Self::DuplicateSignal => "duplicate_signal",
            Self::RunawayLoop => "runaway_loop",
        }
    }

    /// Ordered remediation playbook for the incident kind.
    pub fn playbook(&self) -> &'static [&'static str] {
        match self {
            Self::StuckOrder => &["pause_strategy", "unwind_risk"],
            Self::StaleTick => &["pause_strategy", "reroute_data_feed"],
            Self::DuplicateSignal => &["pause_strategy"],
            Self::RunawayLoop => &["pause_strategy", "unwind_risk", "reroute_execution"],
        }
    }
}

impl std::fmt::Display for IncidentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected failure mode plus its remediation playbook.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub kind: IncidentKind,
    pub severity: Severity,
    pub details: Map<String, Value>,
    pub playbook: Vec<String>,
}

// ---------------------------------------------------------------------------
// Remediation hooks
// ---------------------------------------------------------------------------

/// Hook aliases the playbook actions collapse onto. `reroute_data_feed` and
/// `reroute_execution` both route to `Reroute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAlias {
    Pause,
    Unwind,
    Reroute,
}

impl HookAlias {
    fn for_action(action: &str) -> Option<Self> {
        match action {
            "pause_strategy" => Some(Self::Pause),
            "unwind_risk" => Some(Self::Unwind),
            "reroute_data_feed" | "reroute_execution" => Some(Self::Reroute),
            _ => None,
        }
    }
}

/// Caller-supplied remediation surface. Returning `None` means no hook is
/// installed for the alias; the action is skipped without journalling.
pub trait RemediationHooks: Send + Sync {
    fn dispatch(&self, alias: HookAlias, incident: &Incident) -> Option<anyhow::Result<()>>;
}

/// Hooks that do nothing — used when the engine runs headless surveillance.
pub struct NoopHooks;

impl RemediationHooks for NoopHooks {
    fn dispatch(&self, _alias: HookAlias, _incident: &Incident) -> Option<anyhow::Result<()>> {
        None
    }
}

// ---------------------------------------------------------------------------
// Incident responder
// ---------------------------------------------------------------------------

/// Maps incident kind → playbook → remediation hooks, journalling every
/// hook outcome.
pub struct IncidentResponder {
    journal: Arc<ExecutionJournal>,
    hooks: Arc<dyn RemediationHooks>,
    bus: EventBus,
}

impl IncidentResponder {
    pub fn new(
        journal: Arc<ExecutionJournal>,
        hooks: Arc<dyn RemediationHooks>,
        bus: EventBus,
    ) -> Self {
        Self { journal, hooks, bus }
    }

    pub fn journal(&self) -> &ExecutionJournal {
        &self.journal
    }

    pub fn trigger(&self, kind: IncidentKind, severity: Severity, details: Map<String, Value>) {
        let incident = Incident {
            kind,
            severity,
            details,
            playbook: kind.playbook().iter().map(|s| s.to_string()).collect(),
        };

        let mut payload = Map::new();
        payload.insert("incident".into(), json!(kind.as_str()));
        payload.insert("severity".into(), json!(severity.as_str()));
        payload.insert("details".into(), Value::Object(incident.details.clone()));
        payload.insert("playbook".into(), json!(incident.playbook));
        self.journal.append("incident", payload);

        self.bus.publish(EngineEvent::Incident {
            incident: incident.clone(),
        });

        self.auto_remediate(&incident);
    }

    fn auto_remediate(&self, incident: &Incident) {
        for action in &incident.playbook {
            let Some(alias) = HookAlias::for_action(action) else {
                continue;
            };
            let Some(outcome) = self.hooks.dispatch(alias, incident) else {
                continue;
            };

            let mut record = Map::new();
            record.insert("incident".into(), json!(incident.kind.as_str()));
            record.insert("action".into(), json!(action));
            match outcome {
                Ok(()) => {
                    record.insert("status".into(), json!("executed"));
                }
                Err(err) => {
                    record.insert("status".into(), json!("failed"));
                    record.insert("error".into(), json!(err.to_string()));
                }
            }
            self.journal.append("incident_action", record);
        }
    }
}

// ---------------------------------------------------------------------------
// Anomaly detector
// ---------------------------------------------------------------------------

struct DetectorInner {
    last_tick_ts: HashMap<String, f64>,
    /// order_id -> created_at, set once and never reset.
    active_orders: HashMap<String, f64>,
    stuck_alerted_at: HashMap<String, f64>,
    signal_seen: HashMap<String, f64>,
    loop_window: VecDeque<f64>,
}

/// Timer-driven surveillance of order/tick/signal streams. `heartbeat` must
/// be called from a fixed external timer so quiet markets still surface
/// stuck orders.
pub struct AnomalyDetector {
    responder: Arc<IncidentResponder>,
    stale_tick_seconds: f64,
    loop_threshold: usize,
    inner: Mutex<DetectorInner>,
}

impl AnomalyDetector {
    pub fn new(responder: Arc<IncidentResponder>) -> Self {
        Self::with_thresholds(responder, DEFAULT_STALE_TICK_SECONDS, DEFAULT_LOOP_THRESHOLD)
    }

    pub fn with_thresholds(
        responder: Arc<IncidentResponder>,
        stale_tick_seconds: f64,
        loop_threshold: usize,
    ) -> Self {
        Self {
            responder,
            stale_tick_seconds,
            loop_threshold,
            inner: Mutex::new(DetectorInner {
                last_tick_ts: HashMap::new(),
                active_orders: HashMap::new(),
                stuck_alerted_at: HashMap::new(),
                signal_seen: HashMap::new(),
                loop_window: VecDeque::with_capacity(LOOP_WINDOW_CAPACITY),
            }),
        }
    }

    /// Record tick liveness for `symbol` and scan for a runaway loop.
    pub fn on_tick(&self, symbol: &str, tick_ts: Option<f64>) {
        let now = tick_ts.unwrap_or_else(unix_now);

        let fire_loop = {
            let mut inner = self.inner.lock();
            inner.last_tick_ts.insert(symbol.to_string(), now);
            if inner.loop_window.len() == LOOP_WINDOW_CAPACITY {
                inner.loop_window.pop_front();
            }
            inner.loop_window.push_back(now);

            let recent = inner.loop_window.iter().filter(|t| now - **t <= 1.0).count();
            if recent >= self.loop_threshold {
                inner.loop_window.clear();
                Some(recent)
            } else {
                None
            }
        };

        if let Some(events_per_second) = fire_loop {
            self.responder.trigger(
                IncidentKind::RunawayLoop,
                Severity::Critical,
                details(&[("events_per_second", json!(events_per_second))]),
            );
        }
    }

    /// Duplicate-signal detection. When `raw_id` is blank, a stable fallback
    /// id is derived from the order context so detection still works for
    /// panel orders that never set an explicit signal id.
    pub fn on_signal(&self, raw_id: &str, tradingsymbol: &str, quantity: i64, source: &str) {
        self.on_signal_at(raw_id, tradingsymbol, quantity, source, unix_now());
    }

    fn on_signal_at(&self, raw_id: &str, tradingsymbol: &str, quantity: i64, source: &str, now: f64) {
        let effective_id = if raw_id.is_empty() {
            format!("{tradingsymbol}:{quantity}:{source}")
        } else {
            raw_id.to_string()
        };
        if effective_id.starts_with(':') && effective_id.ends_with(':') {
            // No raw id and no context either — nothing meaningful to compare.
            return;
        }

        let duplicate = {
            let mut inner = self.inner.lock();
            let duplicate = inner
                .signal_seen
                .get(&effective_id)
                .map(|seen| now - seen < DUPLICATE_SIGNAL_WINDOW_SECONDS)
                .unwrap_or(false);
            inner.signal_seen.insert(effective_id.clone(), now);
            duplicate
        };

        if duplicate {
            self.responder.trigger(
                IncidentKind::DuplicateSignal,
                Severity::Medium,
                details(&[("signal_id", json!(effective_id))]),
            );
        }
    }

    pub fn on_order_submitted(&self, order_id: &str) {
        self.inner
            .lock()
            .active_orders
            .insert(order_id.to_string(), unix_now());
    }

    /// Call when a fill/cancel/rejection is confirmed so the order leaves
    /// surveillance along with its alert cooldown state.
    pub fn on_order_closed(&self, order_id: &str) {
        let mut inner = self.inner.lock();
        inner.active_orders.remove(order_id);
        inner.stuck_alerted_at.remove(order_id);
    }

    /// Drive surveillance from a fixed external timer (every 30 s). Must not
    /// depend on order activity — quiet periods still need stuck detection.
    pub fn heartbeat(&self) {
        self.heartbeat_at(unix_now());
    }

    fn heartbeat_at(&self, now: f64) {
        let mut stale: Vec<(String, f64)> = Vec::new();
        let mut stuck: Vec<(String, f64)> = Vec::new();
        let mut evicted: Vec<(String, f64)> = Vec::new();

        {
            let mut inner = self.inner.lock();

            for (symbol, ts) in inner.last_tick_ts.iter_mut() {
                if now - *ts > self.stale_tick_seconds {
                    stale.push((symbol.clone(), now - *ts));
                    // Snooze per-symbol so one outage does not re-alert every
                    // heartbeat.
                    *ts = now;
                }
            }

            let order_ids: Vec<String> = inner.active_orders.keys().cloned().collect();
            for order_id in order_ids {
                let created = inner.active_orders[&order_id];
                let age = now - created;

                if age > STUCK_ORDER_MAX_AGE_SECONDS {
                    // No fill callback is coming; keeping the order would just
                    // pollute the journal with repeated alerts.
                    warn!(order_id = %order_id, age_seconds = age, "auto-evicting order without fill callback");
                    inner.active_orders.remove(&order_id);
                    inner.stuck_alerted_at.remove(&order_id);
                    evicted.push((order_id, age));
                    continue;
                }

                if age > STUCK_ORDER_MIN_AGE_SECONDS {
                    let last_alert = inner.stuck_alerted_at.get(&order_id).copied().unwrap_or(0.0);
                    if now - last_alert >= STUCK_ORDER_ALERT_COOLDOWN_SECONDS {
                        inner.stuck_alerted_at.insert(order_id.clone(), now);
                        stuck.push((order_id, age));
                    }
                }
            }
        }

        for (symbol, seconds) in stale {
            self.responder.trigger(
                IncidentKind::StaleTick,
                Severity::High,
                details(&[
                    ("symbol", json!(symbol)),
                    ("seconds_since_tick", json!(round2(seconds))),
                ]),
            );
        }
        for (order_id, age) in stuck {
            self.responder.trigger(
                IncidentKind::StuckOrder,
                Severity::Critical,
                details(&[
                    ("order_id", json!(order_id)),
                    ("open_for_seconds", json!(round2(age))),
                ]),
            );
        }
        for (order_id, age) in evicted {
            let mut record = Map::new();
            record.insert("order_id".into(), json!(order_id));
            record.insert("open_for_seconds".into(), json!(round2(age)));
            record.insert("reason".into(), json!("no_fill_callback_within_max_age"));
            self.responder.journal().append("order_evicted", record);
        }
    }

    pub fn active_order_count(&self) -> usize {
        self.inner.lock().active_orders.len()
    }
}

impl std::fmt::Debug for AnomalyDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AnomalyDetector")
            .field("active_orders", &inner.active_orders.len())
            .field("tracked_symbols", &inner.last_tick_ts.len())
            .finish()
    }
}

fn details(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// =============================================================================
// API circuit breaker — CLOSED / OPEN / HALF_OPEN with exponential backoff
// =============================================================================
//
// One instance guards one broker API surface. State transitions:
//
//   CLOSED    — all calls allowed; `failure_threshold` consecutive recorded
//               failures open the circuit.
//   OPEN      — calls rejected until the backoff timeout elapses, then the
//               next call probes via HALF_OPEN.
//   HALF_OPEN — up to `half_open_max_calls` probes; `success_threshold`
//               consecutive successes close the circuit, any failure re-opens
//               it with a doubled timeout (capped at `max_timeout`).
//
// The breaker short-circuits BEFORE the retry policy runs: a rejected call
// never consumes a retry attempt.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Construction parameters. Defaults match the production tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub base_timeout_seconds: i64,
    pub half_open_max_calls: u32,
    pub success_threshold: u32,
    pub max_timeout_seconds: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_timeout_seconds: 60,
            half_open_max_calls: 3,
            success_threshold: 2,
            max_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct StateChange {
    state: &'static str,
    time: DateTime<Utc>,
    failures: u32,
    timeout_seconds: i64,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    consecutive_failures: u32,
    half_open_attempts: u32,
    half_open_successes: u32,
    timeout_seconds: i64,
    last_failure_time: Option<DateTime<Utc>>,
    last_state_change: Option<DateTime<Utc>>,

    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    state_changes: Vec<StateChange>,
}

/// Per-API circuit breaker with exponential backoff and metrics.
pub struct ApiCircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl ApiCircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        info!(
            failure_threshold = config.failure_threshold,
            timeout_seconds = config.base_timeout_seconds,
            half_open_calls = config.half_open_max_calls,
            "circuit breaker initialised"
        );
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                consecutive_failures: 0,
                half_open_attempts: 0,
                half_open_successes: 0,
                timeout_seconds: config.base_timeout_seconds,
                last_failure_time: None,
                last_state_change: None,
                total_calls: 0,
                successful_calls: 0,
                failed_calls: 0,
                rejected_calls: 0,
                state_changes: Vec::new(),
            }),
            config,
        }
    }

    /// Check whether a call should be allowed right now. Counting happens
    /// here so rejected calls show up in the metrics.
    pub fn can_execute(&self) -> bool {
        self.can_execute_at(Utc::now())
    }

    fn can_execute_at(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed_ok = inner
                    .last_failure_time
                    .map(|t| (now - t).num_seconds() >= inner.timeout_seconds)
                    .unwrap_or(true);
                if elapsed_ok {
                    Self::to_half_open(&mut inner, now);
                    inner.half_open_attempts = 1;
                    true
                } else {
                    inner.rejected_calls += 1;
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_attempts < self.config.half_open_max_calls {
                    inner.half_open_attempts += 1;
                    true
                } else {
                    inner.rejected_calls += 1;
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.successful_calls += 1;
        inner.consecutive_failures = 0;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                info!(
                    successes = inner.half_open_successes,
                    needed = self.config.success_threshold,
                    "circuit half-open probe succeeded"
                );
                if inner.half_open_successes >= self.config.success_threshold {
                    self.to_closed(&mut inner, Utc::now());
                }
            }
            CircuitState::Closed => {
                if inner.failure_count > 0 {
                    info!(previous_failures = inner.failure_count, "circuit recovered, resetting failure count");
                    inner.failure_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Utc::now());
    }

    fn record_failure_at(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.failed_calls += 1;
        inner.failure_count += 1;
        inner.consecutive_failures += 1;
        inner.last_failure_time = Some(now);

        match inner.state {
            CircuitState::HalfOpen => {
                warn!(attempts = inner.half_open_attempts, "circuit half-open probe failed");
                self.to_open(&mut inner, now);
            }
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.to_open(&mut inner, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn to_open(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner.state = CircuitState::Open;
        inner.last_state_change = Some(now);

        // Double the timeout per consecutive failure streak, up to the cap.
        let exponent = inner.consecutive_failures.saturating_sub(1).min(16);
        inner.timeout_seconds = (self.config.base_timeout_seconds << exponent)
            .min(self.config.max_timeout_seconds);

        inner.state_changes.push(StateChange {
            state: "OPEN",
            time: now,
            failures: inner.failure_count,
            timeout_seconds: inner.timeout_seconds,
        });

        warn!(
            failures = inner.failure_count,
            timeout_seconds = inner.timeout_seconds,
            backoff_level = inner.consecutive_failures,
            "circuit breaker OPEN"
        );
    }

    fn to_half_open(inner: &mut Inner, now: DateTime<Utc>) {
        inner.state = CircuitState::HalfOpen;
        inner.last_state_change = Some(now);
        inner.half_open_attempts = 0;
        inner.half_open_successes = 0;

        inner.state_changes.push(StateChange {
            state: "HALF_OPEN",
            time: now,
            failures: inner.failure_count,
            timeout_seconds: inner.timeout_seconds,
        });

        info!("circuit breaker HALF_OPEN — testing recovery");
    }

    fn to_closed(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner.state = CircuitState::Closed;
        inner.last_state_change = Some(now);
        inner.failure_count = 0;
        inner.half_open_attempts = 0;
        inner.half_open_successes = 0;
        inner.timeout_seconds = self.config.base_timeout_seconds;

        inner.state_changes.push(StateChange {
            state: "CLOSED",
            time: now,
            failures: 0,
            timeout_seconds: inner.timeout_seconds,
        });

        info!("circuit breaker CLOSED — recovery successful");
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Metrics snapshot for the control API.
    pub fn metrics(&self) -> Value {
        let inner = self.inner.lock();
        let success_rate = if inner.total_calls == 0 {
            0.0
        } else {
            inner.successful_calls as f64 / inner.total_calls as f64 * 100.0
        };
        json!({
            "state": inner.state.as_str(),
            "total_calls": inner.total_calls,
            "successful_calls": inner.successful_calls,
            "failed_calls": inner.failed_calls,
            "rejected_calls": inner.rejected_calls,
            "success_rate": success_rate,
            "failure_count": inner.failure_count,
            "timeout_seconds": inner.timeout_seconds,
            "state_changes": inner.state_changes,
            "last_state_change": inner.last_state_change,
        })
    }

    /// Manual reset back to CLOSED (admin action).
    pub fn reset(&self) {
        info!("circuit breaker manually reset");
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        self.to_closed(&mut inner, Utc::now());
    }
}

impl Default for ApiCircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl std::fmt::Debug for ApiCircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCircuitBreaker")
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn breaker() -> ApiCircuitBreaker {
        ApiCircuitBreaker::default()
    }

    #[test]
    fn closed_allows_calls() {
        let cb = breaker();
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_after_failure_threshold() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn open_rejections_are_counted() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        assert!(!cb.can_execute());
        assert!(!cb.can_execute());
        let metrics = cb.metrics();
        assert_eq!(metrics["rejected_calls"], json!(2));
    }

    #[test]
    fn half_open_after_timeout_then_closes_on_successes() {
        let cb = breaker();
        let t0 = Utc::now();
        for _ in 0..5 {
            cb.record_failure_at(t0);
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Before the timeout: rejected.
        assert!(!cb.can_execute_at(t0 + Duration::seconds(30)));

        // After the timeout: probe allowed via HALF_OPEN.
        assert!(cb.can_execute_at(t0 + Duration::seconds(61)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_with_backoff() {
        let cb = breaker();
        let t0 = Utc::now();
        for _ in 0..5 {
            cb.record_failure_at(t0);
        }
        assert!(cb.can_execute_at(t0 + Duration::seconds(61)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // 6th consecutive failure: timeout = min(60 * 2^5, 300) = 300.
        cb.record_failure_at(t0 + Duration::seconds(62));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics()["timeout_seconds"], json!(300));
    }

    #[test]
    fn half_open_limits_probe_calls() {
        let cb = breaker();
        let t0 = Utc::now();
        for _ in 0..5 {
            cb.record_failure_at(t0);
        }
        let probe_time = t0 + Duration::seconds(61);
        assert!(cb.can_execute_at(probe_time)); // transitions, attempt 1
        assert!(cb.can_execute_at(probe_time)); // attempt 2
        assert!(cb.can_execute_at(probe_time)); // attempt 3
        assert!(!cb.can_execute_at(probe_time)); // over the limit
    }

    #[test]
    fn success_in_closed_resets_failure_count() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        // A fresh streak of 4 failures must not open the circuit.
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn manual_reset_closes_circuit() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
        assert_eq!(cb.metrics()["timeout_seconds"], json!(60));
    }
}

// =============================================================================
// Rate-Limit Tracker — keeps the live client inside broker API quotas
// =============================================================================
//
// The broker enforces roughly:
//   - 10 requests per second across all endpoints.
//   - 200 order placements per minute, 3000 per day.
//
// Counters are atomics so any task can consult them lock-free; periodic
// reset methods are driven by timers in the engine wiring.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

/// Hard ceiling on requests per second.
const REQUEST_1S_LIMIT: u32 = 10;
/// Maximum order placements per minute.
const ORDER_1M_LIMIT: u32 = 200;
/// Maximum order placements per day.
const ORDER_1D_LIMIT: u32 = 3_000;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    request_count_1s: AtomicU32,
    order_count_1m: AtomicU32,
    order_count_1d: AtomicU32,
}

/// Immutable snapshot of the current counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub request_count_1s: u32,
    pub order_count_1m: u32,
    pub order_count_1d: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            request_count_1s: AtomicU32::new(0),
            order_count_1m: AtomicU32::new(0),
            order_count_1d: AtomicU32::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Pre-flight checks
    // -------------------------------------------------------------------------

    /// True if another request fits inside the per-second quota.
    pub fn can_send_request(&self) -> bool {
        let current = self.request_count_1s.load(Ordering::Relaxed);
        let allowed = current < REQUEST_1S_LIMIT;
        if !allowed {
            warn!(
                current,
                limit = REQUEST_1S_LIMIT,
                "request blocked — per-second quota exhausted"
            );
        }
        allowed
    }

    /// True if another order placement fits the minute and day quotas.
    pub fn can_place_order(&self) -> bool {
        let count_1m = self.order_count_1m.load(Ordering::Relaxed);
        let count_1d = self.order_count_1d.load(Ordering::Relaxed);

        if count_1m >= ORDER_1M_LIMIT {
            warn!(count_1m, limit = ORDER_1M_LIMIT, "order blocked — per-minute order quota reached");
            return false;
        }
        if count_1d >= ORDER_1D_LIMIT {
            warn!(count_1d, limit = ORDER_1D_LIMIT, "order blocked — daily order quota reached");
            return false;
        }
        true
    }

    // -------------------------------------------------------------------------
    // Bookkeeping
    // -------------------------------------------------------------------------

    pub fn record_request(&self) {
        self.request_count_1s.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_order_sent(&self) {
        self.order_count_1m.fetch_add(1, Ordering::Relaxed);
        self.order_count_1d.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset the per-second request counter (call from a 1 s timer).
    pub fn reset_1s_counter(&self) {
        self.request_count_1s.store(0, Ordering::Relaxed);
    }

    /// Reset the per-minute order counter (call from a 60 s timer).
    pub fn reset_1m_counter(&self) {
        self.order_count_1m.store(0, Ordering::Relaxed);
    }

    /// Reset the daily order counter (call at session rollover).
    pub fn reset_daily_counter(&self) {
        self.order_count_1d.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            request_count_1s: self.request_count_1s.load(Ordering::Relaxed),
            order_count_1m: self.order_count_1m.load(Ordering::Relaxed),
            order_count_1d: self.order_count_1d.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("RateLimitTracker")
            .field("request_count_1s", &snap.request_count_1s)
            .field("order_count_1m", &snap.order_count_1m)
            .field("order_count_1d", &snap.order_count_1d)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_quota_blocks_at_limit() {
        let tracker = RateLimitTracker::new();
        for _ in 0..REQUEST_1S_LIMIT {
            assert!(tracker.can_send_request());
            tracker.record_request();
        }
        assert!(!tracker.can_send_request());

        tracker.reset_1s_counter();
        assert!(tracker.can_send_request());
    }

    #[test]
    fn order_quotas_block_and_reset_independently() {
        let tracker = RateLimitTracker::new();
        for _ in 0..ORDER_1M_LIMIT {
            tracker.record_order_sent();
        }
        assert!(!tracker.can_place_order());

        tracker.reset_1m_counter();
        assert!(tracker.can_place_order());

        let snap = tracker.snapshot();
        assert_eq!(snap.order_count_1m, 0);
        assert_eq!(snap.order_count_1d, ORDER_1M_LIMIT);
    }
}

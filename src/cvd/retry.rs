// =============================================================================
// Pending-order retry timers — one 10 s chase loop per instrument token
// =============================================================================
//
// While a CVD entry sits unfilled at the broker, a per-token task wakes
// every 10 seconds and asks the coordinator to cancel/reprice/resubmit.
// The loop stops when the coordinator reports the chase is over (fill,
// exhaustion, window closed) or when the token's timer is torn down.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use super::coordinator::CvdCoordinator;

/// Seconds between retry ticks.
const RETRY_INTERVAL_SECS: u64 = 10;

#[derive(Default)]
pub struct PendingRetryTimers {
    handles: Mutex<HashMap<u32, JoinHandle<()>>>,
}

impl PendingRetryTimers {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the chase loop for `token` unless one is already running.
    pub fn start(&self, coordinator: Arc<CvdCoordinator>, token: u32) {
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(&token) {
            if !handle.is_finished() {
                return;
            }
        }

        info!(token, interval_secs = RETRY_INTERVAL_SECS, "pending-order retry started");
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(RETRY_INTERVAL_SECS));
            // Skip the immediate first tick; the order just went in.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                coordinator.retry_pending_order(token).await;
            }
        });
        handles.insert(token, handle);
    }

    /// Tear down the timer for `token` if one exists.
    pub fn stop(&self, token: u32) {
        if let Some(handle) = self.handles.lock().remove(&token) {
            handle.abort();
            info!(token, "pending-order retry stopped");
        }
    }

    pub fn is_running(&self, token: u32) -> bool {
        self.handles
            .lock()
            .get(&token)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Abort every timer (engine shutdown).
    pub fn stop_all(&self) {
        for (_, handle) in self.handles.lock().drain() {
            handle.abort();
        }
    }
}

impl Drop for PendingRetryTimers {
    fn drop(&mut self) {
        self.stop_all();
    }
}

impl std::fmt::Debug for PendingRetryTimers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRetryTimers")
            .field("active", &self.handles.lock().len())
            .finish()
    }
}

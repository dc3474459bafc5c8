// =============================================================================
// Engine event bus
// =============================================================================
//
// The desk replaces ad-hoc callback wiring with a single typed broadcast
// channel. Producers publish fire-and-forget; consumers subscribe and are
// allowed to lag (broadcast semantics drop for slow receivers). The journal
// is the lossless record — the bus is for live fan-out only.
// =============================================================================

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::anomaly::Incident;
use crate::broker::OrderRecord;
use crate::cvd::{CvdSignal, MarketStateFrame};
use crate::types::{PendingOrder, Position, Tick};

/// Bounded channel depth. Consumers that fall more than this far behind
/// observe `Lagged` and resynchronise from component snapshots.
const BUS_CAPACITY: usize = 1024;

/// Every cross-subsystem notification the engine emits.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A batch of market ticks was applied.
    TickBatch { ticks: Vec<Tick> },
    /// The position ledger changed (refresh or tick update).
    PositionChanged { positions: Vec<Position> },
    /// A tracked position left the ledger.
    PositionRemoved { tradingsymbol: String },
    /// Broker-side pending orders changed.
    PendingOrdersUpdated { orders: Vec<PendingOrder> },
    /// An order transitioned state (paper fills carry entry/exit bookkeeping).
    OrderUpdate { order: OrderRecord },
    /// An order was refused before reaching the matching engine.
    OrderRejected {
        reason: String,
        tradingsymbol: String,
        quantity: i64,
    },
    /// The anomaly detector raised an incident.
    Incident { incident: Incident },
    /// A CVD automation entry signal was accepted for processing.
    CvdSignal { signal: CvdSignal },
    /// A per-bar market state frame was applied.
    CvdMarketState { frame: MarketStateFrame },
    /// Portfolio-level stop loss or target fired.
    PortfolioExit { reason: String, pnl: f64 },
    /// A position refresh cycle finished.
    RefreshCompleted { ok: bool },
    /// A broker API call failed; the engine continues on stale data.
    ApiError { message: String },
}

/// Thin wrapper owning the broadcast sender so subsystems can be handed a
/// cheap clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. A send error only means nobody is listening, which
    /// is normal during startup and shutdown.
    pub fn publish(&self, event: EngineEvent) {
        if let Err(err) = self.tx.send(event) {
            debug!(error = %err, "event dropped — no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::PortfolioExit {
            reason: "STOP_LOSS".to_string(),
            pnl: -5200.0,
        });

        match rx.recv().await.unwrap() {
            EngineEvent::PortfolioExit { reason, pnl } => {
                assert_eq!(reason, "STOP_LOSS");
                assert!((pnl + 5200.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::RefreshCompleted { ok: true });
        assert_eq!(bus.receiver_count(), 0);
    }
}

// =============================================================================
// CVD automation — per-instrument signal/state machine with durable state
// =============================================================================

pub mod coordinator;
pub mod retry;
pub mod state;

pub use coordinator::{CvdCoordinator, StrikeLadderSnapshot, StrikeRung};
pub use state::{
    AutomationTrade, CvdSignal, CvdStateStore, MarketStateFrame, Route, SignalSide, StrategyType,
};

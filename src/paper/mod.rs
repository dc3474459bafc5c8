// =============================================================================
// Paper trading — simulated matching engine + margin gate
// =============================================================================

pub mod rms;
pub mod simulator;

pub use rms::PaperRms;
pub use simulator::{
    parse_expiry_from_symbol, run_matching_loop, PaperBroker, PaperPosition,
    DEFAULT_STARTING_BALANCE,
};

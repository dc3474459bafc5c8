// =============================================================================
// Execution subsystem — smart routing, slicing, slippage, retry, recording
// =============================================================================

pub mod planner;
pub mod request;
pub mod retry;
pub mod router;
pub mod slippage;
pub mod stack;

pub use planner::ExecutionAlgoPlanner;
pub use request::{ExecutionAlgo, ExecutionRequest, QueuePriority, RouteDecision, Urgency};
pub use retry::{ErrorBucket, RetryPolicy};
pub use router::SmartOrderRouter;
pub use slippage::{SlippageEstimate, SlippageModel};
pub use stack::ExecutionStack;

use thiserror::Error;

/// Terminal failure of an `execute` call. Child order ids placed before the
/// failing slice ride along so the caller can reconcile partial fills.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Margin / RMS refusal — never retried, surfaced to the user.
    #[error("order rejected by risk checks: {reason}")]
    RiskRejection {
        reason: String,
        placed_order_ids: Vec<String>,
    },

    /// Retries exhausted or an unclassified broker failure.
    #[error("execution failed ({bucket}) after {attempts} attempt(s): {message}")]
    Fatal {
        bucket: ErrorBucket,
        attempts: u32,
        message: String,
        placed_order_ids: Vec<String>,
    },
}

impl ExecError {
    /// Child orders that made it to the broker before the failure.
    pub fn placed_order_ids(&self) -> &[String] {
        match self {
            Self::RiskRejection { placed_order_ids, .. } => placed_order_ids,
            Self::Fatal { placed_order_ids, .. } => placed_order_ids,
        }
    }
}

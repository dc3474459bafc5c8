// =============================================================================
// Smart order router
// =============================================================================
//
// Single-broker SOR abstraction, kept as a seam for future multi-venue
// routing. Today it decides queue positioning and the effective order type
// from urgency and the quoted spread.
// =============================================================================

use crate::types::OrderType;

use super::request::{ExecutionRequest, QueuePriority, RouteDecision, Urgency};

/// Spread (in basis points of LTP) beyond which a passive LIMIT join is
/// preferred over crossing.
const WIDE_SPREAD_BPS: f64 = 12.0;

#[derive(Debug, Default)]
pub struct SmartOrderRouter;

impl SmartOrderRouter {
    pub fn new() -> Self {
        Self
    }

    pub fn choose_route(&self, request: &ExecutionRequest) -> RouteDecision {
        let spread = if request.ask > request.bid && request.bid > 0.0 {
            request.ask - request.bid
        } else {
            0.0
        };
        let spread_bps = if request.ltp > 0.0 && spread > 0.0 {
            spread / request.ltp * 10_000.0
        } else {
            0.0
        };

        let mut route = RouteDecision {
            route: "primary",
            queue_priority: QueuePriority::Neutral,
            order_type: request.order_type,
            limit_price: request.limit_price,
        };

        if request.urgency == Urgency::High {
            route.queue_priority = QueuePriority::Take;
            // Cross the spread: lift the limit to at least the offer so a
            // working LIMIT cannot sit behind the market.
            if request.order_type != OrderType::Market && request.ask > 0.0 {
                route.limit_price = Some(request.limit_price.unwrap_or(0.0).max(request.ask));
            }
        } else if spread_bps > WIDE_SPREAD_BPS {
            route.queue_priority = QueuePriority::Join;
            if request.bid > 0.0 {
                route.order_type = OrderType::Limit;
                route.limit_price = Some(request.bid);
            }
        }

        route
    }
}

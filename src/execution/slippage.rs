// =============================================================================
// Slippage model — lightweight pre-trade cost estimator
// =============================================================================
//
// expected_slippage = half-spread + impact, where impact scales with the
// child's participation in the parent order:
//
//   impact = ltp × 0.0004 × participation^0.6
//
// With no usable quotes the spread falls back to 0.1 % of LTP.
// =============================================================================

use serde::Serialize;

use super::request::ExecutionRequest;

/// Base market-impact coefficient.
const IMPACT_COEFFICIENT: f64 = 0.0004;
/// Concavity of impact in participation.
const IMPACT_EXPONENT: f64 = 0.6;
/// Spread fallback when bid/ask are unusable, as a fraction of LTP.
const SPREAD_FALLBACK_FRACTION: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SlippageEstimate {
    pub expected_slippage: f64,
    pub impact_estimate: f64,
}

#[derive(Debug, Default)]
pub struct SlippageModel;

impl SlippageModel {
    pub fn new() -> Self {
        Self
    }

    pub fn estimate(&self, request: &ExecutionRequest, child_qty: i64) -> SlippageEstimate {
        let spread = if request.ask > request.bid && request.bid > 0.0 {
            request.ask - request.bid
        } else {
            request.ltp * SPREAD_FALLBACK_FRACTION
        };
        let spread_cost = spread / 2.0;

        let participation =
            (child_qty as f64 / request.quantity.max(1) as f64).clamp(0.01, 1.0);
        let impact = request.ltp * IMPACT_COEFFICIENT * participation.powf(IMPACT_EXPONENT);

        SlippageEstimate {
            expected_slippage: round4(spread_cost + impact),
            impact_estimate: round4(impact),
        }
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderType, ProductType, TransactionType};

    fn request(qty: i64, ltp: f64, bid: f64, ask: f64) -> ExecutionRequest {
        let mut req = ExecutionRequest::new(
            "NIFTY24DEC24500CE",
            TransactionType::Buy,
            qty,
            OrderType::Market,
            ProductType::Mis,
            ltp,
        );
        req.bid = bid;
        req.ask = ask;
        req
    }

    #[test]
    fn full_participation_uses_full_impact() {
        let est = SlippageModel::new().estimate(&request(50, 120.0, 119.5, 120.5), 50);
        // spread_cost 0.5, impact = 120 * 0.0004 * 1.0 = 0.048
        assert!((est.impact_estimate - 0.048).abs() < 1e-9);
        assert!((est.expected_slippage - 0.548).abs() < 1e-9);
    }

    #[test]
    fn missing_quotes_fall_back_to_ltp_fraction() {
        let est = SlippageModel::new().estimate(&request(50, 100.0, 0.0, 0.0), 50);
        // spread = 0.1, cost = 0.05; impact = 0.04
        assert!((est.expected_slippage - 0.09).abs() < 1e-9);
    }

    #[test]
    fn smaller_children_have_smaller_impact() {
        let model = SlippageModel::new();
        let full = model.estimate(&request(100, 120.0, 119.5, 120.5), 100);
        let slice = model.estimate(&request(100, 120.0, 119.5, 120.5), 25);
        assert!(slice.impact_estimate < full.impact_estimate);
    }

    #[test]
    fn participation_is_floored() {
        let model = SlippageModel::new();
        // 1 of 1000 units → participation clamps at 0.01, not 0.001.
        let est = model.estimate(&request(1000, 120.0, 119.5, 120.5), 1);
        let expected = 120.0 * 0.0004 * 0.01f64.powf(0.6);
        assert!((est.impact_estimate - round4(expected)).abs() < 1e-9);
    }
}

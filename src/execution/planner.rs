// =============================================================================
// Execution algo planner — parent-to-child order slicing
// =============================================================================
//
// Invariants:
//   - the slices always sum to the parent quantity;
//   - no slice is ever zero;
//   - the returned order is the submission order.
// =============================================================================

use rand::Rng;

use super::request::{ExecutionAlgo, ExecutionRequest};

/// Jitter applied per slice when randomisation is on (±15 %).
const SLICE_JITTER: f64 = 0.15;

#[derive(Debug, Default)]
pub struct ExecutionAlgoPlanner;

impl ExecutionAlgoPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn plan(&self, request: &ExecutionRequest) -> Vec<i64> {
        self.plan_with_rng(request, &mut rand::thread_rng())
    }

    pub fn plan_with_rng(&self, request: &ExecutionRequest, rng: &mut impl Rng) -> Vec<i64> {
        let qty = request.quantity.max(1);

        if !request.execution_algo.is_sliced() {
            return vec![qty];
        }

        let slices = request.max_child_orders.max(1).min(qty);
        let base = qty / slices;
        let rem = qty % slices;
        let mut plan: Vec<i64> = (0..slices)
            .map(|i| base + if i < rem { 1 } else { 0 })
            .collect();

        if request.randomize_slices && slices > 1 {
            // Jitter each slice while preserving the total; the last slice
            // absorbs whatever budget remains.
            let mut jittered = Vec::with_capacity(plan.len());
            let mut budget = qty;
            for (i, &child) in plan.iter().enumerate() {
                if i as i64 == slices - 1 {
                    jittered.push(budget);
                    break;
                }
                let jitter = (child.max(1) as f64 * rng.gen_range(-SLICE_JITTER..=SLICE_JITTER)) as i64;
                let mut value = (child + jitter).max(1);
                // Leave at least one unit for every remaining slice.
                value = value.min(budget - (slices - i as i64 - 1));
                jittered.push(value);
                budget -= value;
            }
            plan = jittered;
        }

        plan
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderType, ProductType, TransactionType};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn request(qty: i64, algo: ExecutionAlgo, max_children: i64, randomize: bool) -> ExecutionRequest {
        let mut req = ExecutionRequest::new(
            "NIFTY24DEC24500CE",
            TransactionType::Buy,
            qty,
            OrderType::Market,
            ProductType::Mis,
            120.0,
        );
        req.execution_algo = algo;
        req.max_child_orders = max_children;
        req.randomize_slices = randomize;
        req
    }

    #[test]
    fn immediate_is_single_slice() {
        let planner = ExecutionAlgoPlanner::new();
        assert_eq!(planner.plan(&request(50, ExecutionAlgo::Immediate, 4, true)), vec![50]);
        assert_eq!(planner.plan(&request(50, ExecutionAlgo::Is, 4, true)), vec![50]);
    }

    #[test]
    fn twap_even_split_without_jitter() {
        let planner = ExecutionAlgoPlanner::new();
        assert_eq!(
            planner.plan(&request(100, ExecutionAlgo::Twap, 4, false)),
            vec![25, 25, 25, 25]
        );
    }

    #[test]
    fn remainder_spreads_across_leading_slices() {
        let planner = ExecutionAlgoPlanner::new();
        assert_eq!(
            planner.plan(&request(10, ExecutionAlgo::Vwap, 3, false)),
            vec![4, 3, 3]
        );
    }

    #[test]
    fn slices_clamped_to_quantity() {
        let planner = ExecutionAlgoPlanner::new();
        // More children than units: one unit per slice.
        assert_eq!(
            planner.plan(&request(3, ExecutionAlgo::Twap, 8, false)),
            vec![1, 1, 1]
        );
    }

    #[test]
    fn jitter_preserves_total_and_never_zeroes() {
        let planner = ExecutionAlgoPlanner::new();
        for seed in 0..50u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = planner.plan_with_rng(&request(100, ExecutionAlgo::Pov, 4, true), &mut rng);
            assert_eq!(plan.len(), 4, "seed {seed}");
            assert_eq!(plan.iter().sum::<i64>(), 100, "seed {seed}: {plan:?}");
            assert!(plan.iter().all(|&s| s > 0), "seed {seed}: {plan:?}");
        }
    }

    #[test]
    fn zero_quantity_is_clamped_to_one() {
        let planner = ExecutionAlgoPlanner::new();
        assert_eq!(planner.plan(&request(0, ExecutionAlgo::Immediate, 1, false)), vec![1]);
    }
}

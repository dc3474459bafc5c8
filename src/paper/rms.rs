// =============================================================================
// Paper RMS — margin gatekeeper for the simulated account
// =============================================================================
//
// Deliberately conservative margin model: premium × quantity × 1.1. Margin
// is reserved when a position opens and released at the ENTRY price when it
// closes, so reserve followed by release at the same price and quantity
// always nets to zero used margin.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

/// Buffer applied over raw premium value.
const SAFETY_FACTOR: f64 = 1.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperRms {
    pub starting_balance: f64,
    #[serde(default)]
    pub used_margin: f64,
}

impl PaperRms {
    pub fn new(starting_balance: f64) -> Self {
        Self {
            starting_balance,
            used_margin: 0.0,
        }
    }

    /// Margin required to carry `quantity` units at `price`.
    pub fn required_margin(&self, price: f64, quantity: i64) -> Result<f64, String> {
        if !price.is_finite() || price <= 0.0 || quantity <= 0 {
            return Err("invalid price or quantity for margin calculation".to_string());
        }
        Ok(price * quantity as f64 * SAFETY_FACTOR)
    }

    /// Pre-trade gate. Returns `(false, reason)` when the account cannot
    /// carry the order.
    pub fn can_place_order(&self, price: f64, quantity: i64) -> (bool, String) {
        let required = match self.required_margin(price, quantity) {
            Ok(required) => required,
            Err(reason) => return (false, reason),
        };

        if self.available_margin() < required {
            return (
                false,
                format!(
                    "Insufficient margin. Required: ₹{required:.2}, Available: ₹{:.2}",
                    self.available_margin()
                ),
            );
        }

        (true, String::new())
    }

    pub fn reserve_margin(&mut self, price: f64, quantity: i64) {
        if let Ok(margin) = self.required_margin(price, quantity) {
            self.used_margin += margin;
            info!(margin = format!("{margin:.2}"), used = format!("{:.2}", self.used_margin), "paper RMS reserved margin");
        }
    }

    pub fn release_margin(&mut self, price: f64, quantity: i64) {
        if let Ok(margin) = self.required_margin(price, quantity) {
            self.used_margin = (self.used_margin - margin).max(0.0);
            info!(margin = format!("{margin:.2}"), used = format!("{:.2}", self.used_margin), "paper RMS released margin");
        }
    }

    pub fn available_margin(&self) -> f64 {
        self.starting_balance - self.used_margin
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "used": self.used_margin,
            "available": self.available_margin(),
            "total": self.starting_balance,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn margin_model_applies_safety_factor() {
        let rms = PaperRms::new(1_000_000.0);
        let required = rms.required_margin(100.0, 50).unwrap();
        assert!((required - 5500.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_invalid_inputs() {
        let rms = PaperRms::new(1_000_000.0);
        assert!(rms.required_margin(0.0, 50).is_err());
        assert!(rms.required_margin(100.0, 0).is_err());
        assert!(rms.required_margin(f64::NAN, 50).is_err());
        let (ok, reason) = rms.can_place_order(100.0, -1);
        assert!(!ok);
        assert!(reason.contains("invalid"));
    }

    #[test]
    fn rejects_when_margin_exhausted() {
        let mut rms = PaperRms::new(10_000.0);
        rms.reserve_margin(100.0, 80); // 8800 used

        let (ok, reason) = rms.can_place_order(100.0, 20); // needs 2200 > 1200
        assert!(!ok);
        assert!(reason.contains("Insufficient margin"));
    }

    #[test]
    fn reserve_then_release_at_entry_price_nets_to_zero() {
        let mut rms = PaperRms::new(1_000_000.0);
        rms.reserve_margin(123.45, 75);
        rms.release_margin(123.45, 75);
        assert!(rms.used_margin.abs() < 1e-9);
        assert!((rms.available_margin() - 1_000_000.0).abs() < 1e-9);
    }

    #[test]
    fn release_never_goes_negative() {
        let mut rms = PaperRms::new(1_000_000.0);
        rms.release_margin(100.0, 50);
        assert_eq!(rms.used_margin, 0.0);
    }
}

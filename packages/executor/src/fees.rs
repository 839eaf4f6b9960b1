// ABOUTME: Fee calculation for executed jobs from static and dynamic complexity
// ABOUTME: Produces a breakdown in TG, Ether, and Wei from the configured fee constants

use crate::config::FeesConfig;
use serde::{Deserialize, Serialize};

const WEI_PER_ETHER: f64 = 1e18;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    /// Weighted complexity plus transaction cost, before the fixed multiplier
    pub x: f64,
    pub fee_tg: f64,
    pub fee_ether: f64,
    pub fee_wei: u128,
}

#[derive(Debug, Clone)]
pub struct FeeCalculator {
    config: FeesConfig,
}

impl FeeCalculator {
    pub fn new(config: FeesConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FeesConfig {
        &self.config
    }

    /// Price an execution.
    ///
    /// `fixed_cost` is applied as a multiplier on `x`: `fee_tg = x + fixed_cost * x`.
    pub fn calculate(&self, static_complexity: f64, dynamic_complexity: f64) -> FeeBreakdown {
        let x = static_complexity * self.config.static_complexity_factor
            + dynamic_complexity * self.config.dynamic_complexity_factor
            + self.config.transaction_cost;
        let fee_tg = x + self.config.fixed_cost * x;
        let fee_ether = fee_tg * self.config.price_per_tg;

        FeeBreakdown {
            x,
            fee_tg,
            fee_ether,
            fee_wei: ether_to_wei(fee_ether),
        }
    }

    /// Fee for a job that is priced without running, from static complexity alone
    pub fn calculate_static(&self, static_complexity: f64) -> FeeBreakdown {
        self.calculate(static_complexity, 0.0)
    }
}

fn ether_to_wei(ether: f64) -> u128 {
    let wei = (ether * WEI_PER_ETHER).round();
    if wei.is_finite() && wei > 0.0 {
        wei as u128
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn calculator(static_factor: f64, dynamic_factor: f64) -> FeeCalculator {
        FeeCalculator::new(FeesConfig {
            price_per_tg: 0.0001,
            fixed_cost: 1.0,
            transaction_cost: 1.0,
            static_complexity_factor: static_factor,
            dynamic_complexity_factor: dynamic_factor,
        })
    }

    #[test]
    fn test_reference_fee() {
        let fee = calculator(0.1, 0.01).calculate(10.0, 5.0);
        assert!((fee.x - 2.05).abs() < 1e-12);
        assert!((fee.fee_tg - 4.10).abs() < 1e-12);
        assert!((fee.fee_ether - 0.00041).abs() < 1e-15);
        assert_eq!(fee.fee_wei, 410_000_000_000_000);
    }

    proptest! {
        #[test]
        fn test_fee_formula_holds(
            static_complexity in 0.0f64..1e6,
            dynamic in 0.0f64..1e6,
            static_factor in 0.0f64..10.0,
            dynamic_factor in 0.0f64..10.0,
            fixed_cost in 0.0f64..10.0,
            transaction_cost in 0.0f64..100.0,
        ) {
            let calc = FeeCalculator::new(FeesConfig {
                price_per_tg: 0.0001,
                fixed_cost,
                transaction_cost,
                static_complexity_factor: static_factor,
                dynamic_complexity_factor: dynamic_factor,
            });

            let fee = calc.calculate(static_complexity, dynamic);
            prop_assert_eq!(&fee, &calc.calculate(static_complexity, dynamic));
            prop_assert_eq!(
                fee.x,
                static_complexity * static_factor + dynamic * dynamic_factor + transaction_cost
            );

            let expected = fee.x * (1.0 + fixed_cost);
            prop_assert!((fee.fee_tg - expected).abs() <= 1e-9 * expected.max(1.0));
            prop_assert!(fee.fee_ether >= 0.0);
        }
    }

    #[test]
    fn test_zero_complexity_costs_transaction_fee() {
        let fee = calculator(0.1, 0.1).calculate(0.0, 0.0);
        assert_eq!(fee.x, 1.0);
        assert_eq!(fee.fee_tg, 2.0);
    }

    #[test]
    fn test_static_fee_ignores_dynamic_factor() {
        let calc = calculator(0.1, 100.0);
        assert_eq!(calc.calculate_static(10.0), calc.calculate(10.0, 0.0));
    }

    #[test]
    fn test_negative_ether_clamps_to_zero_wei() {
        assert_eq!(ether_to_wei(-1.0), 0);
        assert_eq!(ether_to_wei(f64::NAN), 0);
    }
}

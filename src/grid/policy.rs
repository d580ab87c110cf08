//! Pure pricing rules for the two-sided grid.
//!
//! Given the last fill (or the initial mid price), the policy produces the
//! pair of prices straddling it, and decides whether a candidate order is
//! admissible: inside the configured band, and affordable with the
//! balances at hand. No I/O and no state.

use crate::errors::PolicyError;
use crate::types::Side;

use super::config::GridConfig;

#[derive(Debug, Clone)]
pub struct GridPolicy {
    gap_ratio: f64,
    min_price: f64,
    max_price: f64,
    price_precision: u32,
    quantity_precision: u32,
    order_quantity: f64,
}

impl GridPolicy {
    pub fn new(config: &GridConfig) -> Self {
        Self {
            gap_ratio: config.gap_ratio,
            min_price: config.min_price,
            max_price: config.max_price,
            price_precision: config.price_precision,
            quantity_precision: config.quantity_precision,
            order_quantity: config.order_quantity,
        }
    }

    /// Buy price one gap below the reference, rounded to the tick and
    /// clamped to the best bid so the order cannot cross the spread.
    pub fn next_buy_price(&self, reference: f64, best_bid: Option<f64>) -> f64 {
        let price = round_to(reference * (1.0 - self.gap_ratio), self.price_precision);
        match best_bid {
            Some(bid) if bid > 0.0 && price > bid => round_to(bid, self.price_precision),
            _ => price,
        }
    }

    /// Sell price one gap above the reference, symmetric to
    /// [`Self::next_buy_price`].
    pub fn next_sell_price(&self, reference: f64, best_ask: Option<f64>) -> f64 {
        let price = round_to(reference * (1.0 + self.gap_ratio), self.price_precision);
        match best_ask {
            Some(ask) if ask > 0.0 && price < ask => round_to(ask, self.price_precision),
            _ => price,
        }
    }

    pub fn order_quantity(&self) -> f64 {
        round_to(self.order_quantity, self.quantity_precision)
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_to(price, self.price_precision)
    }

    /// Rejects prices outside the configured band.
    pub fn validate_band(&self, price: f64) -> Result<(), PolicyError> {
        if price < self.min_price || price > self.max_price {
            return Err(PolicyError::OutOfBand {
                price,
                min: self.min_price,
                max: self.max_price,
            });
        }
        Ok(())
    }

    /// Checks that the available balance covers the order: quote notional
    /// for a buy, base quantity for a sell.
    pub fn check_funds(
        &self,
        side: Side,
        price: f64,
        available: f64,
    ) -> Result<(), PolicyError> {
        let quantity = self.order_quantity();
        let required = match side {
            Side::Bid => price * quantity,
            Side::Ask => quantity,
        };
        if available < required {
            return Err(PolicyError::InsufficientFunds {
                side,
                price,
                required,
                available,
            });
        }
        Ok(())
    }

    /// Full admission check for one candidate order.
    pub fn admit(&self, side: Side, price: f64, available: f64) -> Result<(), PolicyError> {
        self.validate_band(price)?;
        self.check_funds(side, price, available)
    }
}

/// Rounds half-away-from-zero to `precision` decimal places.
pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> GridPolicy {
        let cfg = GridConfig::from_toml_str(
            r#"
            symbol = "SOL_USDC"
            order_quantity = 0.5
            gap_ratio = 0.001
            min_price = 50.0
            max_price = 400.0
            "#,
        )
        .unwrap();
        GridPolicy::new(&cfg)
    }

    #[test]
    fn test_quotes_straddle_the_fill() {
        let policy = policy();
        assert_eq!(policy.next_buy_price(100.0, None), 99.90);
        assert_eq!(policy.next_sell_price(100.0, None), 100.10);
    }

    #[test]
    fn test_prices_round_to_tick() {
        let policy = policy();
        // 333.33 * 0.999 = 332.996..., 333.33 * 1.001 = 333.663...
        assert_eq!(policy.next_buy_price(333.33, None), 333.0);
        assert_eq!(policy.next_sell_price(333.33, None), 333.66);
    }

    #[test]
    fn test_buy_clamps_to_best_bid() {
        let policy = policy();
        // Market moved down since the fill: the naive buy would sit above
        // the best bid and cross the spread.
        assert_eq!(policy.next_buy_price(100.2, Some(99.5)), 99.5);
        // Below the best bid: no clamp.
        assert_eq!(policy.next_buy_price(100.0, Some(99.95)), 99.90);
    }

    #[test]
    fn test_sell_clamps_to_best_ask() {
        let policy = policy();
        assert_eq!(policy.next_sell_price(99.8, Some(100.5)), 100.5);
        assert_eq!(policy.next_sell_price(100.0, Some(100.05)), 100.10);
    }

    #[test]
    fn test_band_rejects_prices_outside() {
        let policy = policy();
        assert!(policy.validate_band(50.0).is_ok());
        assert!(policy.validate_band(400.0).is_ok());
        assert!(matches!(
            policy.validate_band(49.99),
            Err(PolicyError::OutOfBand { .. })
        ));
        assert!(matches!(
            policy.validate_band(400.01),
            Err(PolicyError::OutOfBand { .. })
        ));
    }

    #[test]
    fn test_buy_needs_quote_notional() {
        let policy = policy();
        // 0.5 SOL at 100 needs 50 USDC.
        assert!(policy.check_funds(Side::Bid, 100.0, 50.0).is_ok());
        let err = policy.check_funds(Side::Bid, 100.0, 49.0).unwrap_err();
        assert!(matches!(
            err,
            PolicyError::InsufficientFunds {
                side: Side::Bid,
                required,
                ..
            } if required == 50.0
        ));
    }

    #[test]
    fn test_sell_needs_base_quantity() {
        let policy = policy();
        assert!(policy.check_funds(Side::Ask, 100.0, 0.5).is_ok());
        assert!(policy.check_funds(Side::Ask, 100.0, 0.49).is_err());
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(99.899999, 2), 99.9);
        assert_eq!(round_to(1.005, 3), 1.005);
        assert_eq!(round_to(2.0, 0), 2.0);
    }
}

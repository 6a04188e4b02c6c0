//! Martingale ladder and position aggregates.

use crate::config::StrategyParams;
use crate::error::ConfigError;
use crate::types::Position;
use rust_decimal::Decimal;

/// Entry prices and amounts for each rung of the ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelTable {
    pub prices: Vec<Decimal>,
    pub amounts: Vec<Decimal>,
}

impl LevelTable {
    /// `prices[i] = initial_price * (1 - drop/100)^i`,
    /// `amounts[i] = initial_amount * multiplier^i`.
    ///
    /// Fails when a rung, or the cost of filling the whole ladder, does not fit
    /// in a `Decimal`.
    pub fn generate(params: &StrategyParams) -> Result<Self, ConfigError> {
        let drop_factor = Decimal::ONE - params.price_drop_percent / Decimal::ONE_HUNDRED;
        let mut prices = Vec::with_capacity(params.levels);
        let mut amounts = Vec::with_capacity(params.levels);

        let mut price = params.initial_price;
        let mut amount = params.initial_amount;
        let mut total_cost = Decimal::ZERO;
        for level in 0..params.levels {
            if level > 0 {
                price = price
                    .checked_mul(drop_factor)
                    .ok_or(ConfigError::LadderOverflow { level })?;
                amount = amount
                    .checked_mul(params.amount_multiplier)
                    .ok_or(ConfigError::LadderOverflow { level })?;
            }
            total_cost = amount
                .checked_mul(price)
                .and_then(|cost| total_cost.checked_add(cost))
                .ok_or(ConfigError::LadderOverflow { level })?;
            prices.push(price.normalize());
            amounts.push(amount.normalize());
        }

        Ok(Self { prices, amounts })
    }
}

/// Values derived from the current position list.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Aggregates {
    pub total_invested: Decimal,
    pub total_amount: Decimal,
    pub average_cost: Decimal,
    pub take_profit_price: Decimal,
    pub stop_loss_price: Decimal,
}

impl Aggregates {
    pub fn compute(positions: &[Position], params: &StrategyParams) -> Self {
        let stop_loss_price = stop_loss_price(positions, params);
        if positions.is_empty() {
            return Self {
                stop_loss_price,
                ..Self::default()
            };
        }

        let total_invested: Decimal = positions.iter().map(|p| p.price * p.amount).sum();
        let total_amount: Decimal = positions.iter().map(|p| p.amount).sum();
        let average_cost = if total_amount > Decimal::ZERO {
            total_invested / total_amount
        } else {
            Decimal::ZERO
        };
        let take_profit_price =
            average_cost * (Decimal::ONE + params.take_profit_percent / Decimal::ONE_HUNDRED);

        Self {
            total_invested,
            total_amount,
            average_cost,
            take_profit_price,
            stop_loss_price,
        }
    }
}

/// Anchored on the first fill of the entry cycle, or on the configured initial
/// price while flat. Stays put until the position is fully closed.
pub fn stop_loss_price(positions: &[Position], params: &StrategyParams) -> Decimal {
    let anchor = positions
        .first()
        .map(|p| p.price)
        .unwrap_or(params.initial_price);
    anchor * (Decimal::ONE - params.stop_loss_percent / Decimal::ONE_HUNDRED)
}

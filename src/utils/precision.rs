// src/utils/precision.rs
use rust_decimal::{Decimal, RoundingStrategy};

/// Rounds an amount DOWN to a multiple of `step`, so an order never asks for
/// more than was computed. Example: amount=10.999, step=0.01 -> 10.99
pub fn floor_to_step(amount: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return amount;
    }
    ((amount / step).floor() * step).normalize()
}

/// Rounds a price to the NEAREST multiple of `tick`, halves away from zero.
/// Example: price=100.16, tick=0.1 -> 100.2
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    ((price / tick).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero) * tick)
        .normalize()
}

/// Step size for a given number of decimal places: 3 -> 0.001
pub fn step_from_decimals(decimals: u32) -> Decimal {
    Decimal::new(1, decimals)
}

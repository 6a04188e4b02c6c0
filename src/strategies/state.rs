//! Engine state and the sparse updates used to persist it.

use crate::strategies::levels::Aggregates;
use crate::types::{OrderTag, Position};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything a martingale engine knows about its run. Serializes to the
/// persisted snapshot layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineState {
    pub is_running: bool,
    pub open_orders: BTreeMap<String, OrderTag>,
    pub positions: Vec<Position>,
    #[serde(rename = "martinLevels")]
    pub level_prices: Vec<Decimal>,
    #[serde(rename = "martinAmounts")]
    pub level_amounts: Vec<Decimal>,
    pub total_invested: Decimal,
    pub total_amount: Decimal,
    pub average_cost: Decimal,
    pub take_profit_price: Decimal,
    pub stop_loss_price: Decimal,
    pub take_profit_order_id: Option<String>,
    pub last_error: Option<String>,
}

impl EngineState {
    pub fn aggregates(&self) -> Aggregates {
        Aggregates {
            total_invested: self.total_invested,
            total_amount: self.total_amount,
            average_cost: self.average_cost,
            take_profit_price: self.take_profit_price,
            stop_loss_price: self.stop_loss_price,
        }
    }

    pub fn set_aggregates(&mut self, agg: Aggregates) {
        self.total_invested = agg.total_invested;
        self.total_amount = agg.total_amount;
        self.average_cost = agg.average_cost;
        self.take_profit_price = agg.take_profit_price;
        self.stop_loss_price = agg.stop_loss_price;
    }

    pub fn has_position(&self) -> bool {
        !self.positions.is_empty()
    }

    pub fn order_open_for(&self, tag: OrderTag) -> bool {
        self.open_orders.values().any(|t| *t == tag)
    }

    /// Merge an update into this snapshot. Absent fields stay unchanged.
    pub fn apply(&mut self, update: &StateUpdate) {
        if let Some(is_running) = update.is_running {
            self.is_running = is_running;
        }
        if let Some(open_orders) = &update.open_orders {
            self.open_orders = open_orders.clone();
        }
        if let Some(positions) = &update.positions {
            self.positions = positions.clone();
        }
        if let Some(prices) = &update.level_prices {
            self.level_prices = prices.clone();
        }
        if let Some(amounts) = &update.level_amounts {
            self.level_amounts = amounts.clone();
        }
        if let Some(v) = update.total_invested {
            self.total_invested = v;
        }
        if let Some(v) = update.total_amount {
            self.total_amount = v;
        }
        if let Some(v) = update.average_cost {
            self.average_cost = v;
        }
        if let Some(v) = update.take_profit_price {
            self.take_profit_price = v;
        }
        if let Some(v) = update.stop_loss_price {
            self.stop_loss_price = v;
        }
        if let Some(id) = &update.take_profit_order_id {
            self.take_profit_order_id = id.clone();
        }
        if let Some(err) = &update.last_error {
            self.last_error = err.clone();
        }
    }
}

/// Partial snapshot. `None` means "leave as is"; for the nullable fields
/// `Some(None)` clears the stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_orders: Option<BTreeMap<String, OrderTag>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub positions: Option<Vec<Position>>,
    #[serde(rename = "martinLevels", skip_serializing_if = "Option::is_none")]
    pub level_prices: Option<Vec<Decimal>>,
    #[serde(rename = "martinAmounts", skip_serializing_if = "Option::is_none")]
    pub level_amounts: Option<Vec<Decimal>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_invested: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_cost: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit_order_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<Option<String>>,
}

impl StateUpdate {
    pub fn running(is_running: bool) -> Self {
        Self {
            is_running: Some(is_running),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            last_error: Some(Some(message.into())),
            ..Self::default()
        }
    }

    /// Marks the strategy halted with the reason recorded.
    pub fn halted(message: impl Into<String>) -> Self {
        Self {
            is_running: Some(false),
            ..Self::error(message)
        }
    }

    pub fn orders(state: &EngineState) -> Self {
        Self {
            open_orders: Some(state.open_orders.clone()),
            take_profit_order_id: Some(state.take_profit_order_id.clone()),
            ..Self::default()
        }
    }

    pub fn position(state: &EngineState) -> Self {
        Self {
            positions: Some(state.positions.clone()),
            total_invested: Some(state.total_invested),
            total_amount: Some(state.total_amount),
            average_cost: Some(state.average_cost),
            take_profit_price: Some(state.take_profit_price),
            stop_loss_price: Some(state.stop_loss_price),
            ..Self::default()
        }
    }

    pub fn levels(state: &EngineState) -> Self {
        Self {
            level_prices: Some(state.level_prices.clone()),
            level_amounts: Some(state.level_amounts.clone()),
            ..Self::default()
        }
    }

    /// Every field of the snapshot.
    pub fn full(state: &EngineState) -> Self {
        Self {
            is_running: Some(state.is_running),
            last_error: Some(state.last_error.clone()),
            ..Self::merge(
                Self::levels(state),
                Self::merge(Self::orders(state), Self::position(state)),
            )
        }
    }

    /// Fields present in `b` win over those in `a`.
    fn merge(a: Self, b: Self) -> Self {
        Self {
            is_running: b.is_running.or(a.is_running),
            open_orders: b.open_orders.or(a.open_orders),
            positions: b.positions.or(a.positions),
            level_prices: b.level_prices.or(a.level_prices),
            level_amounts: b.level_amounts.or(a.level_amounts),
            total_invested: b.total_invested.or(a.total_invested),
            total_amount: b.total_amount.or(a.total_amount),
            average_cost: b.average_cost.or(a.average_cost),
            take_profit_price: b.take_profit_price.or(a.take_profit_price),
            stop_loss_price: b.stop_loss_price.or(a.stop_loss_price),
            take_profit_order_id: b.take_profit_order_id.or(a.take_profit_order_id),
            last_error: b.last_error.or(a.last_error),
        }
    }
}

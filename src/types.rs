// src/types.rs
use crate::strategies::state::StateUpdate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type StrategyId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
    Rejected,
}

/// What an order is for. Only `Level` and `TakeProfit` orders are tracked in
/// the open-order table; `Liquidation` sells are fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderTag {
    Level(usize),
    TakeProfit,
    Liquidation,
}

impl OrderTag {
    pub fn is_tracked(&self) -> bool {
        !matches!(self, OrderTag::Liquidation)
    }
}

impl fmt::Display for OrderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderTag::Level(level) => write!(f, "level {}", level),
            OrderTag::TakeProfit => write!(f, "take-profit"),
            OrderTag::Liquidation => write!(f, "liquidation"),
        }
    }
}

/// One filled buy lot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub price: Decimal,
    pub amount: Decimal,
    pub level: usize,
}

/// Order status as reported back by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub id: String,
    pub status: OrderStatus,
    /// Absent on updates synthesized for orders the exchange no longer knows.
    pub side: Option<Side>,
    pub filled: Decimal,
    pub price: Decimal,
}

impl OrderUpdate {
    /// Update standing in for an order the exchange reported as not found.
    pub fn not_found(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: OrderStatus::Canceled,
            side: None,
            filled: Decimal::ZERO,
            price: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: String,
    pub symbol: String,
    pub status: OrderStatus,
}

/// Precision, limits and trading status for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub amount_step: Decimal,
    pub price_tick: Decimal,
    pub min_amount: Decimal,
    pub min_cost: Decimal,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub order_type: OrderType,
    pub side: Side,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub tag: OrderTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Price or market fetch failed; the cycle is skipped.
    MarketData,
    /// `initialize()` failed.
    Initialization,
    /// The engine was driven outside its state machine.
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineFault {
    pub kind: FaultKind,
    pub message: String,
    pub detail: Option<String>,
}

/// A one-way request from an engine to whoever drives it.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    PlaceOrder(OrderRequest),
    CancelOrder { order_id: String, symbol: String },
    CheckOrders { order_ids: Vec<String>, symbol: String },
    StateUpdate(StateUpdate),
    Error(EngineFault),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub strategy_id: StrategyId,
    pub intent: Intent,
}

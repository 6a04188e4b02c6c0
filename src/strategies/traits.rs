// src/strategies/traits.rs
use crate::types::{EngineEvent, OrderTag, OrderUpdate, StrategyId};
use async_trait::async_trait;
use std::time::Duration;

/// A strategy driven by a worker task. It never talks to the order side of
/// the exchange itself: it queues intents that the driver drains with
/// `next_event` and executes, feeding results back through `track_order` and
/// `handle_order_update`.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn id(&self) -> StrategyId;

    fn symbol(&self) -> &str;

    fn check_interval(&self) -> Duration;

    // Load market data and prepare internal state. Never panics; false on failure.
    async fn initialize(&mut self) -> bool;

    fn start(&mut self);

    fn stop(&mut self, cancel_orders: bool, sell_position: bool);

    fn is_running(&self) -> bool;

    // One reconciliation pass.
    async fn run_cycle(&mut self);

    fn handle_order_update(&mut self, update: &OrderUpdate);

    // Record an order the driver placed on the strategy's behalf.
    fn track_order(&mut self, order_id: &str, tag: OrderTag);

    fn record_error(&mut self, message: String);

    fn next_event(&mut self) -> Option<EngineEvent>;
}

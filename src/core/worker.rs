// src/core/worker.rs
use crate::connectors::session::ExchangeSession;
use crate::error::ExchangeError;
use crate::storage::SnapshotStore;
use crate::strategies::state::StateUpdate;
use crate::strategies::traits::Strategy;
use crate::types::{
    EngineFault, FaultKind, Intent, OrderRequest, OrderType, OrderUpdate, StrategyId,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum WorkerCommand {
    Stop {
        cancel_orders: bool,
        sell_position: bool,
    },
}

/// Owns one strategy and executes everything it asks for.
///
/// Intents are handled strictly in the order the strategy queued them, and
/// results (placed order ids, order updates, errors) are fed back before the
/// next intent is taken.
pub struct StrategyWorker<S> {
    strategy: S,
    session: Arc<ExchangeSession>,
    store: Arc<dyn SnapshotStore>,
    order_check_delay: Duration,
    halted: bool,
}

impl<S> StrategyWorker<S>
where
    S: Strategy + 'static,
{
    pub fn new(
        strategy: S,
        session: Arc<ExchangeSession>,
        store: Arc<dyn SnapshotStore>,
        order_check_delay: Duration,
    ) -> Self {
        Self {
            strategy,
            session,
            store,
            order_check_delay,
            halted: false,
        }
    }

    /// Initialize the strategy and flush what it produced.
    pub async fn initialize(&mut self) -> bool {
        let ok = self.strategy.initialize().await;
        self.dispatch().await;
        ok
    }

    pub fn spawn(self) -> WorkerHandle {
        let (commands, receiver) = mpsc::channel(4);
        let strategy_id = self.strategy.id();
        let join = tokio::spawn(self.run(receiver));
        WorkerHandle {
            strategy_id,
            commands,
            join,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>) {
        let strategy_id = self.strategy.id();
        self.strategy.start();
        self.dispatch().await;
        if !self.strategy.is_running() {
            warn!(strategy_id, "Strategy did not start; worker exiting");
            return;
        }

        let interval = self.strategy.check_interval();
        info!(
            strategy_id,
            symbol = %self.strategy.symbol(),
            interval_ms = %interval.as_millis(),
            "Worker loop running"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => {
                    let (cancel_orders, sell_position) = match command {
                        Some(WorkerCommand::Stop { cancel_orders, sell_position }) => {
                            (cancel_orders, sell_position)
                        }
                        None => {
                            warn!(strategy_id, "Command channel closed; stopping strategy");
                            (false, false)
                        }
                    };
                    self.strategy.stop(cancel_orders, sell_position);
                    self.dispatch().await;
                    break;
                }
                _ = ticker.tick() => {
                    self.strategy.run_cycle().await;
                    self.dispatch().await;
                    if self.halted || !self.strategy.is_running() {
                        info!(strategy_id, "Strategy no longer running; worker exiting");
                        break;
                    }
                }
            }
        }
        info!(strategy_id, "Worker stopped");
    }

    /// Drain the strategy's queue. Handling an intent may queue more; those
    /// are processed in the same pass.
    async fn dispatch(&mut self) {
        let own_id = self.strategy.id();
        while let Some(event) = self.strategy.next_event() {
            if event.strategy_id != own_id {
                error!(
                    strategy_id = own_id,
                    "Dropping event addressed to strategy {}", event.strategy_id
                );
                continue;
            }
            match event.intent {
                Intent::PlaceOrder(request) => self.place_order(request).await,
                Intent::CancelOrder { order_id, symbol } => {
                    self.cancel_order(&order_id, &symbol).await
                }
                Intent::CheckOrders { order_ids, symbol } => {
                    self.check_orders(&order_ids, &symbol).await
                }
                Intent::StateUpdate(update) => self.persist(&update).await,
                Intent::Error(fault) => self.handle_fault(fault).await,
            }
        }
    }

    async fn persist(&self, update: &StateUpdate) {
        if let Err(e) = self.store.apply(self.strategy.id(), update).await {
            error!(strategy_id = self.strategy.id(), "Failed to save state: {}", e);
        }
    }

    fn validate_request(&self, request: &OrderRequest) -> Result<(), String> {
        if request.amount <= Decimal::ZERO {
            return Err(format!("amount {} must be positive", request.amount));
        }
        if request.order_type == OrderType::Limit
            && request.price.map_or(true, |p| p <= Decimal::ZERO)
        {
            return Err("limit order without a positive price".to_string());
        }
        if let Some(market) = self.session.cached_market(&request.symbol) {
            if !market.active {
                return Err(format!("market {} is not trading", request.symbol));
            }
        }
        Ok(())
    }

    async fn place_order(&mut self, request: OrderRequest) {
        let strategy_id = self.strategy.id();
        if request.tag.is_tracked() && !self.strategy.is_running() {
            warn!(strategy_id, "Strategy stopped; dropping {} order", request.tag);
            return;
        }
        if let Err(reason) = self.validate_request(&request) {
            warn!(strategy_id, "Order rejected before submission: {}", reason);
            self.strategy
                .record_error(format!("order rejected before submission: {}", reason));
            return;
        }

        let result = match (request.order_type, request.price) {
            (OrderType::Limit, Some(price)) => {
                self.session
                    .place_limit_order(&request.symbol, request.side, request.amount, price)
                    .await
            }
            _ => {
                self.session
                    .place_market_order(&request.symbol, request.side, request.amount)
                    .await
            }
        };

        match result {
            Ok(response) => {
                info!(
                    strategy_id,
                    order_id = %response.id,
                    "✅ Order placed: {} {} @ {:?} ({})",
                    request.side,
                    request.amount,
                    request.price,
                    request.tag
                );
                if request.tag.is_tracked() {
                    self.strategy.track_order(&response.id, request.tag);
                }
            }
            Err(ExchangeError::InsufficientFunds(msg)) => {
                error!(
                    strategy_id,
                    "Insufficient funds for {} order ({}); stopping strategy", request.tag, msg
                );
                self.strategy
                    .record_error(format!("insufficient funds: {}", msg));
                self.strategy.stop(true, false);
                self.halted = true;
            }
            Err(err) if err.is_transient() => {
                warn!(strategy_id, "Failed to place {} order, next cycle will retry: {}", request.tag, err);
                self.strategy
                    .record_error(format!("failed to place {} order: {}", request.tag, err));
            }
            Err(err) => {
                error!(strategy_id, "⚠️ Failed to place {} order: {}", request.tag, err);
                self.strategy
                    .record_error(format!("failed to place {} order: {}", request.tag, err));
            }
        }
    }

    async fn cancel_order(&mut self, order_id: &str, symbol: &str) {
        let strategy_id = self.strategy.id();
        match self.session.cancel_order(order_id, symbol).await {
            Ok(()) => info!(strategy_id, order_id, "Order cancelled"),
            Err(ExchangeError::OrderNotFound(_)) => {
                info!(strategy_id, order_id, "Order already gone; nothing to cancel")
            }
            Err(err) => {
                error!(strategy_id, order_id, "Failed to cancel order: {}", err);
                self.strategy
                    .record_error(format!("failed to cancel order {}: {}", order_id, err));
            }
        }
    }

    async fn check_orders(&mut self, order_ids: &[String], symbol: &str) {
        let strategy_id = self.strategy.id();
        for (i, order_id) in order_ids.iter().enumerate() {
            if i > 0 && !self.order_check_delay.is_zero() {
                tokio::time::sleep(self.order_check_delay).await;
            }
            match self.session.fetch_order(order_id, symbol).await {
                Ok(update) => {
                    debug!(strategy_id, order_id = %order_id, "Order status {:?}", update.status);
                    self.strategy.handle_order_update(&update);
                }
                Err(ExchangeError::OrderNotFound(_)) => {
                    warn!(strategy_id, order_id = %order_id, "Order not found on exchange");
                    self.strategy
                        .handle_order_update(&OrderUpdate::not_found(order_id));
                }
                Err(err) => {
                    error!(strategy_id, order_id = %order_id, "Failed to check order: {}", err);
                    self.strategy
                        .record_error(format!("failed to check order {}: {}", order_id, err));
                }
            }
        }
    }

    async fn handle_fault(&mut self, fault: EngineFault) {
        let strategy_id = self.strategy.id();
        match fault.kind {
            FaultKind::MarketData => {
                warn!(strategy_id, "Market data error: {}", fault.message);
                self.strategy.record_error(fault.message);
            }
            FaultKind::Initialization => {
                error!(strategy_id, "Initialization error: {}", fault.message);
                self.strategy.record_error(fault.message);
                self.persist(&StateUpdate::running(false)).await;
            }
            FaultKind::Critical => {
                error!(
                    strategy_id,
                    detail = ?fault.detail,
                    "Critical strategy error: {}; halting", fault.message
                );
                self.strategy.record_error(fault.message);
                self.strategy.stop(true, false);
                self.persist(&StateUpdate::running(false)).await;
                self.halted = true;
            }
        }
    }
}

/// Handle to a spawned [`StrategyWorker`].
pub struct WorkerHandle {
    strategy_id: StrategyId,
    commands: mpsc::Sender<WorkerCommand>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn strategy_id(&self) -> StrategyId {
        self.strategy_id
    }

    /// True once the worker exited on its own (stop-loss, halt) or was stopped.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Ask the worker to stop the strategy and wait until it has.
    pub async fn stop(self, cancel_orders: bool, sell_position: bool) {
        let command = WorkerCommand::Stop {
            cancel_orders,
            sell_position,
        };
        if self.commands.send(command).await.is_err() {
            debug!(strategy_id = self.strategy_id, "Worker already exited");
        }
        if let Err(e) = self.join.await {
            error!(strategy_id = self.strategy_id, "Worker task failed: {}", e);
        }
    }
}

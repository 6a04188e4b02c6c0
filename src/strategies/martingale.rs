//! Martingale strategy engine.
//!
//! Buys a ladder of levels as the price falls, keeps one take-profit order
//! covering the whole position, and liquidates everything when the price
//! breaks the stop-loss. The engine only decides; every exchange action is
//! queued as an [`Intent`] for the driver to execute.

use crate::config::StrategyParams;
use crate::connectors::session::ExchangeSession;
use crate::error::{EngineError, ExchangeError};
use crate::strategies::levels::{stop_loss_price, Aggregates, LevelTable};
use crate::strategies::state::{EngineState, StateUpdate};
use crate::strategies::traits::Strategy;
use crate::types::{
    EngineEvent, EngineFault, FaultKind, Intent, MarketSnapshot, OrderRequest, OrderStatus,
    OrderTag, OrderType, OrderUpdate, Position, Side, StrategyId,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The initial buy is skipped while the price sits more than 1% above level 0.
const INITIAL_BUY_TOLERANCE: Decimal = Decimal::from_parts(101, 0, 0, false, 2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    Stopped,
    StoppedOnStopLoss,
}

pub struct MartingaleEngine {
    strategy_id: StrategyId,
    symbol: String,
    params: StrategyParams,
    session: Arc<ExchangeSession>,
    market: Option<MarketSnapshot>,
    phase: EnginePhase,
    state: EngineState,
    events: VecDeque<EngineEvent>,
}

impl MartingaleEngine {
    pub fn new(
        strategy_id: StrategyId,
        symbol: impl Into<String>,
        params: StrategyParams,
        session: Arc<ExchangeSession>,
        restored: Option<EngineState>,
    ) -> Self {
        let mut state = restored.unwrap_or_default();
        // Only `start()` makes an engine run, whatever the snapshot says.
        state.is_running = false;
        let symbol = symbol.into();
        info!("Engine created for strategy {} ({})", strategy_id, symbol);

        Self {
            strategy_id,
            symbol,
            params,
            session,
            market: None,
            phase: EnginePhase::Uninitialized,
            state,
            events: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    fn emit(&mut self, intent: Intent) {
        self.events.push_back(EngineEvent {
            strategy_id: self.strategy_id,
            intent,
        });
    }

    fn emit_update(&mut self, update: StateUpdate) {
        self.emit(Intent::StateUpdate(update));
    }

    fn emit_fault(&mut self, kind: FaultKind, message: String, detail: Option<String>) {
        self.emit(Intent::Error(EngineFault {
            kind,
            message,
            detail,
        }));
    }

    async fn try_initialize(&mut self) -> Result<(), EngineError> {
        let market = self
            .session
            .load_market(&self.symbol)
            .await
            .map_err(|err| match err {
                ExchangeError::MarketNotFound(symbol) => EngineError::MarketNotFound(symbol),
                other => EngineError::MarketData(other),
            })?;
        info!(
            "Market loaded: {} (base {}, quote {}), amount step {}, price tick {}, min amount {}, min cost {}",
            market.symbol,
            market.base,
            market.quote,
            market.amount_step,
            market.price_tick,
            market.min_amount,
            market.min_cost
        );

        let restored_levels = self.state.level_prices.len();
        if restored_levels == self.params.levels
            && self.state.level_amounts.len() == self.params.levels
        {
            info!("Using {} restored martingale levels", restored_levels);
        } else {
            if restored_levels > 0 {
                warn!(
                    "Restored level table has {} levels but {} are configured; recomputing",
                    restored_levels, self.params.levels
                );
            }
            let table = LevelTable::generate(&self.params)?;
            self.state.level_prices = table.prices;
            self.state.level_amounts = table.amounts;
            self.emit_update(StateUpdate::levels(&self.state));
        }
        for (level, (price, amount)) in self
            .state
            .level_prices
            .iter()
            .zip(&self.state.level_amounts)
            .enumerate()
        {
            debug!("Level {}: price {}, amount {}", level, price, amount);
        }

        self.validate_amounts(&market)?;
        self.market = Some(market);

        if self.state.has_position() {
            info!("Recomputing position from {} restored fills", self.state.positions.len());
            self.recalculate_position();
        } else {
            self.state.stop_loss_price = stop_loss_price(&[], &self.params);
            info!("Initial stop-loss price: {}", self.state.stop_loss_price);
            self.emit_update(StateUpdate {
                stop_loss_price: Some(self.state.stop_loss_price),
                ..StateUpdate::default()
            });
        }
        Ok(())
    }

    fn validate_amounts(&self, market: &MarketSnapshot) -> Result<(), EngineError> {
        for (level, amount) in self.state.level_amounts.iter().enumerate() {
            let precise = self.session.amount_to_precision(market, *amount);
            if precise < market.min_amount || precise <= Decimal::ZERO {
                return Err(EngineError::LevelValidation {
                    level,
                    amount: precise,
                    minimum: market.min_amount,
                });
            }
        }
        Ok(())
    }

    /// Recompute aggregates from the position list. Emits an update only when
    /// something actually changed.
    fn recalculate_position(&mut self) -> bool {
        let agg = Aggregates::compute(&self.state.positions, &self.params);
        if agg == self.state.aggregates() {
            return false;
        }
        self.state.set_aggregates(agg);
        info!(
            "Position recalculated: invested {}, amount {}, avg cost {}, TP {}, SL {}",
            agg.total_invested,
            agg.total_amount,
            agg.average_cost.round_dp(8),
            agg.take_profit_price.round_dp(8),
            agg.stop_loss_price.round_dp(8)
        );
        self.emit_update(StateUpdate::position(&self.state));
        true
    }

    fn request_limit_order(&mut self, side: Side, amount: Decimal, price: Decimal, tag: OrderTag) {
        let Some(market) = self.market.clone() else {
            warn!("No market metadata loaded; dropping {} order for {}", side, tag);
            return;
        };
        let amount = self.session.amount_to_precision(&market, amount);
        let price = self.session.price_to_precision(&market, price);

        if amount <= Decimal::ZERO || amount < market.min_amount {
            warn!(
                "Order amount {} below minimum {}; skipping {} order for {}",
                amount, market.min_amount, side, tag
            );
            return;
        }
        if market.min_cost > Decimal::ZERO && amount * price < market.min_cost {
            warn!(
                "Order cost {} x {} below minimum {}; skipping {} order for {}",
                amount, price, market.min_cost, side, tag
            );
            return;
        }

        info!("Requesting {} limit order: {} @ {} ({})", side, amount, price, tag);
        self.emit(Intent::PlaceOrder(OrderRequest {
            symbol: self.symbol.clone(),
            order_type: OrderType::Limit,
            side,
            amount,
            price: Some(price),
            tag,
        }));
    }

    /// Market-sell the whole position and forget it locally.
    fn request_liquidation(&mut self) {
        let amount = match &self.market {
            Some(market) => self.session.amount_to_precision(market, self.state.total_amount),
            None => self.state.total_amount,
        };
        if amount > Decimal::ZERO {
            warn!("Requesting market sell of the whole position: {}", amount);
            self.emit(Intent::PlaceOrder(OrderRequest {
                symbol: self.symbol.clone(),
                order_type: OrderType::Market,
                side: Side::Sell,
                amount,
                price: None,
                tag: OrderTag::Liquidation,
            }));
        }
        self.state.positions.clear();
        self.recalculate_position();
    }

    fn request_cancel_all(&mut self) {
        let order_ids: Vec<String> = self.state.open_orders.keys().cloned().collect();
        if !order_ids.is_empty() {
            info!("Requesting cancellation of {} open order(s)", order_ids.len());
        }
        for order_id in order_ids {
            self.emit(Intent::CancelOrder {
                order_id,
                symbol: self.symbol.clone(),
            });
        }
        self.state.open_orders.clear();
        self.state.take_profit_order_id = None;
    }

    fn request_take_profit(&mut self) {
        if let Some(previous) = self.state.take_profit_order_id.take() {
            info!("Requesting cancellation of previous take-profit order {}", previous);
            self.emit(Intent::CancelOrder {
                order_id: previous,
                symbol: self.symbol.clone(),
            });
            self.emit_update(StateUpdate {
                take_profit_order_id: Some(None),
                ..StateUpdate::default()
            });
        }

        let (amount, price) = (self.state.total_amount, self.state.take_profit_price);
        if amount > Decimal::ZERO && price > Decimal::ZERO {
            self.request_limit_order(Side::Sell, amount, price, OrderTag::TakeProfit);
        } else {
            warn!(
                "Cannot place take-profit order: amount {}, price {}",
                amount, price
            );
        }
    }

    fn place_initial_buy_if_needed(&mut self, reference_price: Decimal) {
        if self.state.order_open_for(OrderTag::Level(0)) {
            debug!("Initial buy order (level 0) already open");
            return;
        }
        let (Some(&level_price), Some(&amount)) = (
            self.state.level_prices.first(),
            self.state.level_amounts.first(),
        ) else {
            warn!("Level table is empty; cannot place the initial buy");
            return;
        };
        if reference_price > level_price * INITIAL_BUY_TOLERANCE {
            info!(
                "Price {} too high for initial buy at {}; waiting",
                reference_price, level_price
            );
            return;
        }
        self.request_limit_order(Side::Buy, amount, level_price, OrderTag::Level(0));
    }

    fn place_next_level_if_needed(&mut self, price: Decimal) {
        let Some(highest) = self.state.positions.iter().map(|p| p.level).max() else {
            return;
        };
        let target = highest + 1;
        if target >= self.params.levels || target >= self.state.level_prices.len() {
            debug!("All {} levels filled", self.params.levels);
            return;
        }
        let target_price = self.state.level_prices[target];
        if price > target_price {
            debug!(
                "Price {} has not reached level {} at {}",
                price, target, target_price
            );
            return;
        }
        if self.state.order_open_for(OrderTag::Level(target)) {
            debug!("Order for level {} already open", target);
            return;
        }
        info!("Price {} triggered buy for level {}", price, target);
        let amount = self.state.level_amounts[target];
        self.request_limit_order(Side::Buy, amount, target_price, OrderTag::Level(target));
    }

    fn trigger_stop_loss(&mut self, price: Decimal) {
        warn!(
            "🛑 STOP LOSS TRIGGERED: price {} <= stop-loss {}",
            price, self.state.stop_loss_price
        );
        self.phase = EnginePhase::StoppedOnStopLoss;
        self.state.is_running = false;

        self.request_cancel_all();
        if self.state.total_amount > Decimal::ZERO {
            self.request_liquidation();
        }

        self.state.last_error = Some(format!("Stop loss triggered at price {}", price));
        self.emit_update(StateUpdate::full(&self.state));
        warn!("Stop-loss processing finished; engine stopped");
    }
}

#[async_trait]
impl Strategy for MartingaleEngine {
    fn id(&self) -> StrategyId {
        self.strategy_id
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn check_interval(&self) -> Duration {
        self.params.check_interval()
    }

    async fn initialize(&mut self) -> bool {
        if self.phase == EnginePhase::Running {
            warn!("Engine is running; initialize() ignored");
            return true;
        }
        info!("Initializing...");
        self.phase = EnginePhase::Initializing;

        match self.try_initialize().await {
            Ok(()) => {
                self.phase = EnginePhase::Ready;
                info!("Initialization complete");
                true
            }
            Err(err) => {
                error!("Initialization failed: {}", err);
                self.phase = EnginePhase::Uninitialized;
                self.market = None;
                self.emit_fault(
                    FaultKind::Initialization,
                    format!("initialization failed: {}", err),
                    Some(format!("{:?}", err)),
                );
                false
            }
        }
    }

    fn start(&mut self) {
        match self.phase {
            EnginePhase::Running => {
                warn!("Engine already running");
                return;
            }
            EnginePhase::Uninitialized | EnginePhase::Initializing => {
                error!("Engine not initialized; call initialize() before start()");
                self.emit_fault(FaultKind::Critical, EngineError::NotInitialized.to_string(), None);
                return;
            }
            EnginePhase::Stopped | EnginePhase::StoppedOnStopLoss => {
                warn!("Engine has stopped; it must be re-created to run again");
                return;
            }
            EnginePhase::Ready => {}
        }

        info!(
            "Starting check loop every {} ms",
            self.params.check_interval().as_millis()
        );
        self.phase = EnginePhase::Running;
        self.state.is_running = true;
        self.emit_update(StateUpdate::running(true));
    }

    fn stop(&mut self, cancel_orders: bool, sell_position: bool) {
        if self.phase != EnginePhase::Running {
            warn!("Engine not running; stop() ignored");
            return;
        }
        info!(
            "Stopping engine (cancel orders: {}, sell position: {})",
            cancel_orders, sell_position
        );
        self.phase = EnginePhase::Stopped;
        self.state.is_running = false;

        if cancel_orders {
            self.request_cancel_all();
        }
        if sell_position && self.state.total_amount > Decimal::ZERO {
            self.request_liquidation();
        }

        self.emit_update(StateUpdate::full(&self.state));
        info!("Engine stopped");
    }

    fn is_running(&self) -> bool {
        self.phase == EnginePhase::Running
    }

    async fn run_cycle(&mut self) {
        if self.phase != EnginePhase::Running {
            debug!("Engine not running; skipping cycle");
            return;
        }
        debug!("Running check...");

        let price = match self.session.fetch_last_price(&self.symbol).await {
            Ok(price) if price > Decimal::ZERO => price,
            Ok(price) => {
                error!("Ticker returned unusable price {}", price);
                self.emit_fault(
                    FaultKind::MarketData,
                    format!("ticker returned unusable price {}", price),
                    None,
                );
                return;
            }
            Err(err) => {
                error!("Failed to fetch ticker: {}", err);
                self.emit_fault(
                    FaultKind::MarketData,
                    format!("failed to fetch price: {}", err),
                    Some(format!("{:?}", err)),
                );
                return;
            }
        };
        debug!("Current price: {}", price);

        if self.state.has_position() && price <= self.state.stop_loss_price {
            self.trigger_stop_loss(price);
            return;
        }

        let open_ids: Vec<String> = self.state.open_orders.keys().cloned().collect();
        let has_open_orders = !open_ids.is_empty();
        if has_open_orders {
            debug!("Requesting status check for {} open order(s)", open_ids.len());
            self.emit(Intent::CheckOrders {
                order_ids: open_ids,
                symbol: self.symbol.clone(),
            });
        }

        if !self.state.has_position() && !has_open_orders {
            self.place_initial_buy_if_needed(price);
        } else if self.state.has_position() {
            // A new level only goes out once the previous fill has its take-profit.
            if self.state.take_profit_order_id.is_some() || !has_open_orders {
                self.place_next_level_if_needed(price);
            } else {
                debug!("Waiting for take-profit placement before the next level");
            }
        }
        debug!("Check finished");
    }

    fn handle_order_update(&mut self, update: &OrderUpdate) {
        let Some(tag) = self.state.open_orders.get(&update.id).copied() else {
            warn!(
                "Ignoring update for unknown or already processed order {}",
                update.id
            );
            return;
        };
        info!("Order {} ({}) update: {:?}", update.id, tag, update.status);

        match update.status {
            OrderStatus::Open => return,
            OrderStatus::Closed => {
                self.state.open_orders.remove(&update.id);
                match (update.side, tag) {
                    (Some(Side::Buy), OrderTag::Level(level)) => {
                        info!(
                            "Level {} buy filled: {} @ {}",
                            level, update.filled, update.price
                        );
                        self.state.positions.push(Position {
                            price: update.price,
                            amount: update.filled,
                            level,
                        });
                        self.recalculate_position();
                        self.request_take_profit();
                    }
                    (Some(Side::Sell), OrderTag::TakeProfit) => {
                        info!("🎯 Take-profit order {} filled; restarting the cycle", update.id);
                        self.state.take_profit_order_id = None;
                        self.state.positions.clear();
                        self.recalculate_position();
                        self.place_initial_buy_if_needed(update.price);
                    }
                    (side, tag) => {
                        warn!(
                            "Order {} closed with side {:?} but was tracked as {}",
                            update.id, side, tag
                        );
                    }
                }
            }
            OrderStatus::Canceled | OrderStatus::Rejected => {
                warn!(
                    "Order {} ({}) is {:?}; no longer tracking it",
                    update.id, tag, update.status
                );
                self.state.open_orders.remove(&update.id);
                if self.state.take_profit_order_id.as_deref() == Some(update.id.as_str()) {
                    self.state.take_profit_order_id = None;
                    warn!(
                        "Take-profit order {} is gone and is not re-placed automatically",
                        update.id
                    );
                }
            }
        }

        self.emit_update(StateUpdate::orders(&self.state));
    }

    fn track_order(&mut self, order_id: &str, tag: OrderTag) {
        if !tag.is_tracked() {
            return;
        }
        self.state.open_orders.insert(order_id.to_string(), tag);
        if tag == OrderTag::TakeProfit {
            self.state.take_profit_order_id = Some(order_id.to_string());
        }
        self.emit_update(StateUpdate::orders(&self.state));
    }

    fn record_error(&mut self, message: String) {
        self.state.last_error = Some(message.clone());
        self.emit_update(StateUpdate::error(message));
    }

    fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::paper::PaperExchange;
    use rust_decimal_macros::dec;

    const SYMBOL: &str = "BTC/USDT";

    fn params() -> StrategyParams {
        StrategyParams {
            initial_price: dec!(100),
            initial_amount: dec!(1),
            levels: 3,
            price_drop_percent: dec!(10),
            amount_multiplier: dec!(2),
            take_profit_percent: dec!(8),
            stop_loss_percent: dec!(30),
            check_interval_ms: Some(10),
        }
    }

    fn paper() -> Arc<PaperExchange> {
        let exchange = Arc::new(PaperExchange::new());
        exchange.add_market(PaperExchange::spot_market(SYMBOL, 3, 2, dec!(0.001)));
        exchange.set_price(SYMBOL, dec!(100));
        exchange
    }

    fn engine_with(
        exchange: &Arc<PaperExchange>,
        params: StrategyParams,
        restored: Option<EngineState>,
    ) -> MartingaleEngine {
        let session = Arc::new(ExchangeSession::new(
            "test",
            exchange.clone(),
            Duration::from_secs(1),
            Duration::ZERO,
        ));
        MartingaleEngine::new(1, SYMBOL, params, session, restored)
    }

    async fn running_engine(
        exchange: &Arc<PaperExchange>,
        params: StrategyParams,
    ) -> MartingaleEngine {
        let mut engine = engine_with(exchange, params, None);
        assert!(engine.initialize().await);
        engine.start();
        assert!(engine.is_running());
        drain(&mut engine);
        engine
    }

    fn drain(engine: &mut MartingaleEngine) -> Vec<Intent> {
        std::iter::from_fn(|| engine.next_event())
            .map(|event| {
                assert_eq!(event.strategy_id, 1);
                event.intent
            })
            .collect()
    }

    fn orders(intents: &[Intent]) -> Vec<OrderRequest> {
        intents
            .iter()
            .filter_map(|intent| match intent {
                Intent::PlaceOrder(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    fn cancels(intents: &[Intent]) -> Vec<String> {
        intents
            .iter()
            .filter_map(|intent| match intent {
                Intent::CancelOrder { order_id, .. } => Some(order_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn filled(id: &str, side: Side, amount: Decimal, price: Decimal) -> OrderUpdate {
        OrderUpdate {
            id: id.to_string(),
            status: OrderStatus::Closed,
            side: Some(side),
            filled: amount,
            price,
        }
    }

    /// Running engine holding a level-0 fill at 100 with its take-profit tracked as "tp".
    async fn engine_in_position(
        exchange: &Arc<PaperExchange>,
        params: StrategyParams,
    ) -> MartingaleEngine {
        let mut engine = running_engine(exchange, params).await;
        engine.run_cycle().await;
        drain(&mut engine);
        engine.track_order("l0", OrderTag::Level(0));
        engine.handle_order_update(&filled("l0", Side::Buy, dec!(1), dec!(100)));
        drain(&mut engine);
        engine.track_order("tp", OrderTag::TakeProfit);
        drain(&mut engine);
        engine
    }

    #[tokio::test]
    async fn test_initialize_computes_levels_and_stop_loss() {
        let exchange = paper();
        let mut engine = engine_with(&exchange, params(), None);

        assert!(engine.initialize().await);
        assert_eq!(engine.phase(), EnginePhase::Ready);
        assert_eq!(
            engine.state().level_prices,
            vec![dec!(100), dec!(90), dec!(81)]
        );
        assert_eq!(engine.state().level_amounts, vec![dec!(1), dec!(2), dec!(4)]);
        assert_eq!(engine.state().stop_loss_price, dec!(70));

        let intents = drain(&mut engine);
        assert!(intents.iter().any(|i| matches!(
            i,
            Intent::StateUpdate(StateUpdate { level_prices: Some(p), .. }) if p.len() == 3
        )));
        assert!(intents.iter().any(|i| matches!(
            i,
            Intent::StateUpdate(StateUpdate { stop_loss_price: Some(sl), .. }) if *sl == dec!(70)
        )));
    }

    #[tokio::test]
    async fn test_initialize_fails_for_unknown_market() {
        let exchange = Arc::new(PaperExchange::new());
        let mut engine = engine_with(&exchange, params(), None);

        assert!(!engine.initialize().await);
        assert_eq!(engine.phase(), EnginePhase::Uninitialized);
        let intents = drain(&mut engine);
        assert!(matches!(
            intents.last(),
            Some(Intent::Error(EngineFault {
                kind: FaultKind::Initialization,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_initialize_rejects_level_below_market_minimum() {
        let exchange = paper();
        // 0.0004 floors to 0 with a 0.001 step
        let mut engine = engine_with(
            &exchange,
            StrategyParams {
                initial_amount: dec!(0.0004),
                ..params()
            },
            None,
        );

        assert!(!engine.initialize().await);
        assert_eq!(engine.phase(), EnginePhase::Uninitialized);
        engine.start();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_initialize_fails_when_ladder_overflows() {
        let exchange = paper();
        let mut engine = engine_with(
            &exchange,
            StrategyParams {
                levels: 100,
                ..params()
            },
            None,
        );

        assert!(!engine.initialize().await);
        assert_eq!(engine.phase(), EnginePhase::Uninitialized);
        let intents = drain(&mut engine);
        assert!(matches!(
            intents.last(),
            Some(Intent::Error(EngineFault {
                kind: FaultKind::Initialization,
                message,
                ..
            })) if message.contains("initialization failed")
        ));
    }

    #[tokio::test]
    async fn test_start_without_initialize_is_critical() {
        let exchange = paper();
        let mut engine = engine_with(&exchange, params(), None);

        engine.start();
        assert!(!engine.is_running());
        let intents = drain(&mut engine);
        assert_eq!(intents.len(), 1);
        assert!(matches!(
            &intents[0],
            Intent::Error(EngineFault {
                kind: FaultKind::Critical,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_start_twice_warns_only() {
        let exchange = paper();
        let mut engine = running_engine(&exchange, params()).await;
        engine.start();
        assert!(drain(&mut engine).is_empty());
    }

    #[tokio::test]
    async fn test_initial_buy_guard() {
        let exchange = paper();
        let mut engine = running_engine(&exchange, params()).await;

        exchange.set_price(SYMBOL, dec!(101.5));
        engine.run_cycle().await;
        assert!(orders(&drain(&mut engine)).is_empty());

        exchange.set_price(SYMBOL, dec!(101));
        engine.run_cycle().await;
        let placed = orders(&drain(&mut engine));
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].tag, OrderTag::Level(0));
        assert_eq!(placed[0].side, Side::Buy);
        assert_eq!(placed[0].order_type, OrderType::Limit);
        assert_eq!(placed[0].price, Some(dec!(100)));
        assert_eq!(placed[0].amount, dec!(1));
    }

    #[tokio::test]
    async fn test_no_duplicate_initial_buy_while_open() {
        let exchange = paper();
        let mut engine = running_engine(&exchange, params()).await;

        engine.run_cycle().await;
        assert_eq!(orders(&drain(&mut engine)).len(), 1);
        engine.track_order("l0", OrderTag::Level(0));
        drain(&mut engine);

        engine.run_cycle().await;
        let intents = drain(&mut engine);
        assert!(orders(&intents).is_empty());
        assert!(intents.iter().any(|i| matches!(
            i,
            Intent::CheckOrders { order_ids, .. } if order_ids == &vec!["l0".to_string()]
        )));
    }

    #[tokio::test]
    async fn test_no_duplicate_level_entry() {
        let exchange = paper();
        let mut engine = engine_in_position(&exchange, params()).await;

        exchange.set_price(SYMBOL, dec!(89));
        engine.run_cycle().await;
        let placed = orders(&drain(&mut engine));
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].tag, OrderTag::Level(1));
        assert_eq!(placed[0].price, Some(dec!(90)));
        assert_eq!(placed[0].amount, dec!(2));
        engine.track_order("l1", OrderTag::Level(1));
        drain(&mut engine);

        exchange.set_price(SYMBOL, dec!(88));
        engine.run_cycle().await;
        assert!(orders(&drain(&mut engine)).is_empty());
    }

    #[tokio::test]
    async fn test_next_level_waits_for_take_profit() {
        let exchange = paper();
        let mut engine = engine_in_position(&exchange, params()).await;

        exchange.set_price(SYMBOL, dec!(89));
        engine.run_cycle().await;
        drain(&mut engine);
        engine.track_order("l1", OrderTag::Level(1));
        engine.handle_order_update(&filled("l1", Side::Buy, dec!(2), dec!(90)));
        let intents = drain(&mut engine);
        // old take-profit is cancelled, the replacement is requested but not yet placed
        assert_eq!(cancels(&intents), vec!["tp".to_string()]);
        assert_eq!(engine.state().take_profit_order_id, None);

        exchange.set_price(SYMBOL, dec!(80));
        engine.run_cycle().await;
        let intents = drain(&mut engine);
        assert!(orders(&intents).is_empty());
        assert!(intents
            .iter()
            .any(|i| matches!(i, Intent::CheckOrders { .. })));
    }

    #[tokio::test]
    async fn test_buy_fill_requests_take_profit_for_whole_position() {
        let exchange = paper();
        let mut engine = running_engine(&exchange, params()).await;
        engine.run_cycle().await;
        drain(&mut engine);
        engine.track_order("l0", OrderTag::Level(0));
        drain(&mut engine);

        engine.handle_order_update(&filled("l0", Side::Buy, dec!(1), dec!(100)));
        let intents = drain(&mut engine);
        let placed = orders(&intents);
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, Side::Sell);
        assert_eq!(placed[0].tag, OrderTag::TakeProfit);
        assert_eq!(placed[0].amount, dec!(1));
        assert_eq!(placed[0].price, Some(dec!(108)));

        let state = engine.state();
        assert_eq!(state.positions.len(), 1);
        assert_eq!(state.average_cost, dec!(100));
        assert_eq!(state.take_profit_price, dec!(108));
        assert!(state.open_orders.is_empty());
    }

    #[tokio::test]
    async fn test_take_profit_round_trip() {
        let exchange = paper();
        let params = StrategyParams {
            take_profit_percent: dec!(0.5),
            ..params()
        };
        let mut engine = running_engine(&exchange, params).await;
        engine.run_cycle().await;
        drain(&mut engine);
        engine.track_order("l0", OrderTag::Level(0));
        engine.handle_order_update(&filled("l0", Side::Buy, dec!(1), dec!(100)));
        let placed = orders(&drain(&mut engine));
        assert_eq!(placed[0].tag, OrderTag::TakeProfit);
        assert_eq!(placed[0].price, Some(dec!(100.5)));

        engine.track_order("tp", OrderTag::TakeProfit);
        assert_eq!(engine.state().take_profit_order_id.as_deref(), Some("tp"));
        drain(&mut engine);

        engine.handle_order_update(&filled("tp", Side::Sell, dec!(1), dec!(100.5)));
        let intents = drain(&mut engine);
        let placed = orders(&intents);
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].tag, OrderTag::Level(0));
        assert_eq!(placed[0].side, Side::Buy);
        assert_eq!(placed[0].price, Some(dec!(100)));

        let state = engine.state();
        assert!(state.positions.is_empty());
        assert_eq!(state.total_amount, Decimal::ZERO);
        assert_eq!(state.average_cost, Decimal::ZERO);
        assert_eq!(state.take_profit_price, Decimal::ZERO);
        assert_eq!(state.take_profit_order_id, None);
        assert_eq!(state.stop_loss_price, dec!(70));
    }

    #[tokio::test]
    async fn test_take_profit_fill_above_tolerance_waits_for_next_cycle() {
        let exchange = paper();
        let mut engine = engine_in_position(&exchange, params()).await;

        engine.handle_order_update(&filled("tp", Side::Sell, dec!(1), dec!(108)));
        assert!(orders(&drain(&mut engine)).is_empty());

        exchange.set_price(SYMBOL, dec!(100.4));
        engine.run_cycle().await;
        let placed = orders(&drain(&mut engine));
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].tag, OrderTag::Level(0));
    }

    #[tokio::test]
    async fn test_stop_loss_liquidates_and_halts() {
        let exchange = paper();
        let mut engine = engine_in_position(&exchange, params()).await;
        exchange.set_price(SYMBOL, dec!(89));
        engine.run_cycle().await;
        drain(&mut engine);
        engine.track_order("l1", OrderTag::Level(1));
        drain(&mut engine);

        exchange.set_price(SYMBOL, dec!(69));
        engine.run_cycle().await;
        let intents = drain(&mut engine);

        let mut cancelled = cancels(&intents);
        cancelled.sort();
        assert_eq!(cancelled, vec!["l1".to_string(), "tp".to_string()]);
        let placed = orders(&intents);
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].order_type, OrderType::Market);
        assert_eq!(placed[0].side, Side::Sell);
        assert_eq!(placed[0].amount, dec!(1));
        assert_eq!(placed[0].tag, OrderTag::Liquidation);
        assert!(!intents
            .iter()
            .any(|i| matches!(i, Intent::CheckOrders { .. })));

        match intents.last() {
            Some(Intent::StateUpdate(update)) => {
                assert_eq!(update.is_running, Some(false));
                assert_eq!(update.open_orders.as_ref().map(|o| o.len()), Some(0));
                assert_eq!(update.positions.as_ref().map(|p| p.len()), Some(0));
                assert_eq!(update.total_amount, Some(Decimal::ZERO));
                assert!(matches!(
                    &update.last_error,
                    Some(Some(msg)) if msg.contains("Stop loss")
                ));
            }
            other => panic!("expected final snapshot, got {:?}", other),
        }

        assert!(!engine.is_running());
        assert_eq!(engine.phase(), EnginePhase::StoppedOnStopLoss);

        exchange.set_price(SYMBOL, dec!(60));
        engine.run_cycle().await;
        assert!(drain(&mut engine).is_empty());
        engine.start();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_stop_loss_needs_a_position() {
        let exchange = paper();
        let mut engine = running_engine(&exchange, params()).await;
        exchange.set_price(SYMBOL, dec!(50));
        engine.run_cycle().await;
        drain(&mut engine);
        assert!(engine.is_running());
    }

    #[tokio::test]
    async fn test_canceled_take_profit_is_not_replaced() {
        let exchange = paper();
        let mut engine = engine_in_position(&exchange, params()).await;

        engine.handle_order_update(&OrderUpdate::not_found("tp"));
        let intents = drain(&mut engine);
        assert!(orders(&intents).is_empty());
        assert_eq!(engine.state().take_profit_order_id, None);
        assert!(engine.state().open_orders.is_empty());
        assert_eq!(engine.state().positions.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_updates_are_ignored() {
        let exchange = paper();
        let mut engine = engine_in_position(&exchange, params()).await;

        engine.handle_order_update(&filled("nope", Side::Buy, dec!(5), dec!(10)));
        assert!(drain(&mut engine).is_empty());

        // the level-0 fill was already applied
        engine.handle_order_update(&filled("l0", Side::Buy, dec!(1), dec!(100)));
        assert!(drain(&mut engine).is_empty());
        assert_eq!(engine.state().positions.len(), 1);
    }

    #[tokio::test]
    async fn test_open_status_changes_nothing() {
        let exchange = paper();
        let mut engine = engine_in_position(&exchange, params()).await;
        let before = engine.state().clone();

        engine.handle_order_update(&OrderUpdate {
            id: "tp".to_string(),
            status: OrderStatus::Open,
            side: Some(Side::Sell),
            filled: Decimal::ZERO,
            price: dec!(108),
        });
        assert!(drain(&mut engine).is_empty());
        assert_eq!(engine.state(), &before);
    }

    #[tokio::test]
    async fn test_recalculate_is_idempotent() {
        let exchange = paper();
        let mut engine = engine_in_position(&exchange, params()).await;
        let before = engine.state().aggregates();

        assert!(!engine.recalculate_position());
        assert!(!engine.recalculate_position());
        assert_eq!(engine.state().aggregates(), before);
        assert!(drain(&mut engine).is_empty());
    }

    #[tokio::test]
    async fn test_price_fetch_failure_skips_cycle() {
        let exchange = paper();
        let mut engine = engine_in_position(&exchange, params()).await;
        let before = engine.state().clone();

        exchange.fail_price_fetch(true);
        engine.run_cycle().await;
        let intents = drain(&mut engine);
        assert_eq!(intents.len(), 1);
        assert!(matches!(
            &intents[0],
            Intent::Error(EngineFault {
                kind: FaultKind::MarketData,
                ..
            })
        ));
        assert_eq!(engine.state(), &before);
        assert!(engine.is_running());
    }

    #[tokio::test]
    async fn test_stop_cancels_sells_and_is_idempotent() {
        let exchange = paper();
        let mut engine = engine_in_position(&exchange, params()).await;

        engine.stop(true, true);
        let intents = drain(&mut engine);
        assert_eq!(cancels(&intents), vec!["tp".to_string()]);
        let placed = orders(&intents);
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].order_type, OrderType::Market);
        assert_eq!(placed[0].amount, dec!(1));
        assert!(matches!(
            intents.last(),
            Some(Intent::StateUpdate(StateUpdate {
                is_running: Some(false),
                ..
            }))
        ));
        assert_eq!(engine.phase(), EnginePhase::Stopped);
        assert!(engine.state().positions.is_empty());

        engine.stop(true, true);
        assert!(drain(&mut engine).is_empty());
        engine.run_cycle().await;
        assert!(drain(&mut engine).is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_cancel_keeps_tracking() {
        let exchange = paper();
        let mut engine = engine_in_position(&exchange, params()).await;

        engine.stop(false, false);
        let intents = drain(&mut engine);
        assert!(cancels(&intents).is_empty());
        assert!(orders(&intents).is_empty());
        assert!(engine.state().open_orders.contains_key("tp"));
        assert_eq!(engine.state().positions.len(), 1);
    }

    #[tokio::test]
    async fn test_restored_state_is_recomputed() {
        let exchange = paper();
        let restored = EngineState {
            is_running: true,
            positions: vec![
                Position {
                    price: dec!(100),
                    amount: dec!(1),
                    level: 0,
                },
                Position {
                    price: dec!(90),
                    amount: dec!(2),
                    level: 1,
                },
            ],
            level_prices: vec![dec!(100), dec!(90), dec!(81)],
            level_amounts: vec![dec!(1), dec!(2), dec!(4)],
            ..EngineState::default()
        };
        let mut engine = engine_with(&exchange, params(), Some(restored));
        assert!(!engine.state().is_running);

        assert!(engine.initialize().await);
        let state = engine.state();
        assert_eq!(state.total_invested, dec!(280));
        assert_eq!(state.total_amount, dec!(3));
        assert_eq!(state.stop_loss_price, dec!(70));
        let intents = drain(&mut engine);
        // restored levels are reused, only the position is re-published
        assert!(!intents.iter().any(|i| matches!(
            i,
            Intent::StateUpdate(StateUpdate {
                level_prices: Some(_),
                ..
            })
        )));
        assert!(intents.iter().any(|i| matches!(
            i,
            Intent::StateUpdate(StateUpdate {
                positions: Some(_),
                ..
            })
        )));
    }

    #[tokio::test]
    async fn test_mismatched_restored_levels_are_recomputed() {
        let exchange = paper();
        let restored = EngineState {
            level_prices: vec![dec!(50)],
            level_amounts: vec![dec!(1)],
            ..EngineState::default()
        };
        let mut engine = engine_with(&exchange, params(), Some(restored));
        assert!(engine.initialize().await);
        assert_eq!(
            engine.state().level_prices,
            vec![dec!(100), dec!(90), dec!(81)]
        );
    }

    #[tokio::test]
    async fn test_record_error_is_published() {
        let exchange = paper();
        let mut engine = running_engine(&exchange, params()).await;
        engine.record_error("order placement failed".to_string());
        assert_eq!(
            engine.state().last_error.as_deref(),
            Some("order placement failed")
        );
        assert_eq!(
            drain(&mut engine),
            vec![Intent::StateUpdate(StateUpdate::error("order placement failed"))]
        );
    }
}

// src/connectors/paper.rs
use crate::config::AccountConfig;
use crate::connectors::traits::{ExchangeClient, ExchangeConnector};
use crate::error::ExchangeError;
use crate::types::{MarketSnapshot, OrderResponse, OrderStatus, OrderType, OrderUpdate, Side};
use crate::utils::precision::step_from_decimals;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct PaperOrder {
    pub id: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: Side,
    pub amount: Decimal,
    pub price: Decimal,
    pub status: OrderStatus,
    pub filled: Decimal,
}

#[derive(Default)]
struct PaperBook {
    markets: HashMap<String, MarketSnapshot>,
    prices: HashMap<String, Decimal>,
    orders: BTreeMap<u64, PaperOrder>,
    next_id: u64,
    /// Free quote currency; `None` means unlimited.
    quote_balance: Option<Decimal>,
    fail_price_fetch: bool,
    latency: Option<Duration>,
}

impl PaperBook {
    /// Fill every resting limit order the last price has crossed.
    fn match_orders(&mut self, symbol: &str) {
        let Some(last) = self.prices.get(symbol).copied() else {
            return;
        };
        let mut credited = Decimal::ZERO;
        for order in self.orders.values_mut() {
            if order.symbol != symbol || order.status != OrderStatus::Open {
                continue;
            }
            let crossed = match order.side {
                Side::Buy => last <= order.price,
                Side::Sell => last >= order.price,
            };
            if crossed {
                order.status = OrderStatus::Closed;
                order.filled = order.amount;
                if order.side == Side::Sell {
                    credited += order.amount * order.price;
                }
                info!(
                    "📝 Paper fill: {} {} {} @ {}",
                    order.side, order.amount, order.symbol, order.price
                );
            }
        }
        if let Some(balance) = self.quote_balance.as_mut() {
            *balance += credited;
        }
    }

    fn reserve(&mut self, cost: Decimal) -> Result<(), ExchangeError> {
        if let Some(balance) = self.quote_balance.as_mut() {
            if cost > *balance {
                return Err(ExchangeError::InsufficientFunds(format!(
                    "need {} but only {} available",
                    cost, balance
                )));
            }
            *balance -= cost;
        }
        Ok(())
    }

    fn insert(&mut self, mut order: PaperOrder) -> OrderResponse {
        self.next_id += 1;
        order.id = self.next_id.to_string();
        let response = OrderResponse {
            id: order.id.clone(),
            symbol: order.symbol.clone(),
            status: order.status,
        };
        self.orders.insert(self.next_id, order);
        response
    }

    fn order_mut(&mut self, order_id: &str) -> Option<&mut PaperOrder> {
        let key = order_id.parse::<u64>().ok()?;
        self.orders.get_mut(&key)
    }
}

/// In-memory exchange used for dry runs and tests. Limit orders rest until
/// the last price crosses them and then fill in full at their limit price.
///
/// With an upstream client attached, market metadata and prices come from
/// the real exchange while orders stay local.
pub struct PaperExchange {
    book: Mutex<PaperBook>,
    upstream: Option<Arc<dyn ExchangeClient>>,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            book: Mutex::new(PaperBook::default()),
            upstream: None,
        }
    }

    pub fn with_market_data(upstream: Arc<dyn ExchangeClient>) -> Self {
        Self {
            book: Mutex::new(PaperBook::default()),
            upstream: Some(upstream),
        }
    }

    /// A `BASE/QUOTE` spot market with the given decimal precisions.
    pub fn spot_market(
        symbol: &str,
        amount_decimals: u32,
        price_decimals: u32,
        min_amount: Decimal,
    ) -> MarketSnapshot {
        let (base, quote) = symbol.split_once('/').unwrap_or((symbol, ""));
        MarketSnapshot {
            symbol: symbol.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
            amount_step: step_from_decimals(amount_decimals),
            price_tick: step_from_decimals(price_decimals),
            min_amount,
            min_cost: Decimal::ZERO,
            active: true,
        }
    }

    fn book(&self) -> MutexGuard<'_, PaperBook> {
        // A panic while holding the lock leaves plain data behind; keep using it.
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_market(&self, market: MarketSnapshot) {
        self.book().markets.insert(market.symbol.clone(), market);
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        let mut book = self.book();
        book.prices.insert(symbol.to_string(), price);
        book.match_orders(symbol);
    }

    pub fn set_quote_balance(&self, balance: Option<Decimal>) {
        self.book().quote_balance = balance;
    }

    pub fn quote_balance(&self) -> Option<Decimal> {
        self.book().quote_balance
    }

    pub fn fail_price_fetch(&self, fail: bool) {
        self.book().fail_price_fetch = fail;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.book().latency = Some(latency);
    }

    pub fn orders(&self) -> Vec<PaperOrder> {
        self.book().orders.values().cloned().collect()
    }

    pub fn open_orders(&self, symbol: &str) -> Vec<PaperOrder> {
        self.book()
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.status == OrderStatus::Open)
            .cloned()
            .collect()
    }

    async fn simulate_latency(&self) {
        let latency = self.book().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn load_market(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError> {
        self.simulate_latency().await;
        if let Some(market) = self.book().markets.get(symbol).cloned() {
            return Ok(market);
        }
        let upstream = self
            .upstream
            .as_ref()
            .ok_or_else(|| ExchangeError::MarketNotFound(symbol.to_string()))?;
        let market = upstream.load_market(symbol).await?;
        self.add_market(market.clone());
        Ok(market)
    }

    async fn fetch_last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.simulate_latency().await;
        if self.book().fail_price_fetch {
            return Err(ExchangeError::Network("simulated ticker outage".to_string()));
        }
        if let Some(upstream) = &self.upstream {
            let price = upstream.fetch_last_price(symbol).await?;
            self.set_price(symbol, price);
            return Ok(price);
        }
        self.book()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::MarketNotFound(symbol.to_string()))
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Result<OrderResponse, ExchangeError> {
        self.simulate_latency().await;
        let mut book = self.book();
        if !book.markets.contains_key(symbol) {
            return Err(ExchangeError::MarketNotFound(symbol.to_string()));
        }
        if amount <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder(format!(
                "amount {} / price {} must be positive",
                amount, price
            )));
        }
        if side == Side::Buy {
            book.reserve(amount * price)?;
        }
        let response = book.insert(PaperOrder {
            id: String::new(),
            symbol: symbol.to_string(),
            order_type: OrderType::Limit,
            side,
            amount,
            price,
            status: OrderStatus::Open,
            filled: Decimal::ZERO,
        });
        book.match_orders(symbol);
        Ok(response)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
    ) -> Result<OrderResponse, ExchangeError> {
        self.simulate_latency().await;
        let mut book = self.book();
        let last = book.prices.get(symbol).copied().ok_or_else(|| {
            ExchangeError::InvalidOrder(format!("no last price known for {}", symbol))
        })?;
        match side {
            Side::Buy => book.reserve(amount * last)?,
            Side::Sell => {
                if let Some(balance) = book.quote_balance.as_mut() {
                    *balance += amount * last;
                }
            }
        }
        Ok(book.insert(PaperOrder {
            id: String::new(),
            symbol: symbol.to_string(),
            order_type: OrderType::Market,
            side,
            amount,
            price: last,
            status: OrderStatus::Closed,
            filled: amount,
        }))
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<(), ExchangeError> {
        self.simulate_latency().await;
        let mut book = self.book();
        let released = match book.order_mut(order_id) {
            Some(order) if order.status == OrderStatus::Open => {
                order.status = OrderStatus::Canceled;
                match order.side {
                    Side::Buy => order.amount * order.price,
                    Side::Sell => Decimal::ZERO,
                }
            }
            _ => return Err(ExchangeError::OrderNotFound(order_id.to_string())),
        };
        if let Some(balance) = book.quote_balance.as_mut() {
            *balance += released;
        }
        Ok(())
    }

    async fn fetch_order(&self, order_id: &str, _symbol: &str) -> Result<OrderUpdate, ExchangeError> {
        self.simulate_latency().await;
        let mut book = self.book();
        let order = book
            .order_mut(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;
        Ok(OrderUpdate {
            id: order.id.clone(),
            status: order.status,
            side: Some(order.side),
            filled: order.filled,
            price: order.price,
        })
    }
}

/// Hands out the same paper book for every account.
pub struct PaperConnector {
    exchange: Arc<PaperExchange>,
}

impl PaperConnector {
    pub fn new(exchange: Arc<PaperExchange>) -> Self {
        Self { exchange }
    }
}

impl ExchangeConnector for PaperConnector {
    fn connect(&self, _account: &AccountConfig) -> Result<Arc<dyn ExchangeClient>, ExchangeError> {
        Ok(self.exchange.clone())
    }
}

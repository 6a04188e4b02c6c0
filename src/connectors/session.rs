//! Per-account gateway in front of an [`ExchangeClient`].
//!
//! Every strategy trading on the same account shares one session. The session
//! bounds each call with a timeout and keeps a minimum gap between calls so a
//! burst of intents from several strategies cannot trip the exchange's rate
//! limits. It never retries: a failed call is reported and the next cycle
//! tries again.

use crate::connectors::traits::ExchangeClient;
use crate::error::ExchangeError;
use crate::types::{MarketSnapshot, OrderResponse, OrderUpdate, Side};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

pub struct ExchangeSession {
    account: String,
    client: Arc<dyn ExchangeClient>,
    call_timeout: Duration,
    min_spacing: Duration,
    last_call: Mutex<Option<Instant>>,
    markets: RwLock<HashMap<String, MarketSnapshot>>,
}

impl ExchangeSession {
    pub fn new(
        account: impl Into<String>,
        client: Arc<dyn ExchangeClient>,
        call_timeout: Duration,
        min_spacing: Duration,
    ) -> Self {
        Self {
            account: account.into(),
            client,
            call_timeout,
            min_spacing,
            last_call: Mutex::new(None),
            markets: RwLock::new(HashMap::new()),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn exchange_name(&self) -> &str {
        self.client.name()
    }

    async fn throttle(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_spacing;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn guarded<T, F>(&self, call: F) -> Result<T, ExchangeError>
    where
        F: Future<Output = Result<T, ExchangeError>>,
    {
        self.throttle().await;
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    account = %self.account,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "Exchange call timed out"
                );
                Err(ExchangeError::Timeout)
            }
        }
    }

    pub async fn load_market(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError> {
        let market = self.guarded(self.client.load_market(symbol)).await?;
        if let Ok(mut markets) = self.markets.write() {
            markets.insert(symbol.to_string(), market.clone());
        }
        Ok(market)
    }

    /// Market metadata from the last successful `load_market`.
    pub fn cached_market(&self, symbol: &str) -> Option<MarketSnapshot> {
        self.markets
            .read()
            .ok()
            .and_then(|markets| markets.get(symbol).cloned())
    }

    pub async fn fetch_last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.guarded(self.client.fetch_last_price(symbol)).await
    }

    pub async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Result<OrderResponse, ExchangeError> {
        self.guarded(self.client.place_limit_order(symbol, side, amount, price))
            .await
    }

    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
    ) -> Result<OrderResponse, ExchangeError> {
        self.guarded(self.client.place_market_order(symbol, side, amount))
            .await
    }

    pub async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError> {
        self.guarded(self.client.cancel_order(order_id, symbol)).await
    }

    pub async fn fetch_order(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<OrderUpdate, ExchangeError> {
        self.guarded(self.client.fetch_order(order_id, symbol)).await
    }

    pub fn amount_to_precision(&self, market: &MarketSnapshot, amount: Decimal) -> Decimal {
        self.client.amount_to_precision(market, amount)
    }

    pub fn price_to_precision(&self, market: &MarketSnapshot, price: Decimal) -> Decimal {
        self.client.price_to_precision(market, price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::paper::PaperExchange;
    use rust_decimal_macros::dec;

    fn session(exchange: Arc<PaperExchange>, timeout_ms: u64, spacing_ms: u64) -> ExchangeSession {
        ExchangeSession::new(
            "test",
            exchange,
            Duration::from_millis(timeout_ms),
            Duration::from_millis(spacing_ms),
        )
    }

    #[tokio::test]
    async fn test_slow_call_maps_to_timeout() {
        let exchange = Arc::new(PaperExchange::new());
        exchange.add_market(PaperExchange::spot_market("BTC/USDT", 3, 2, dec!(0.001)));
        exchange.set_price("BTC/USDT", dec!(100));
        exchange.set_latency(Duration::from_millis(300));

        let session = session(exchange, 20, 0);
        let result = session.fetch_last_price("BTC/USDT").await;
        assert!(matches!(result, Err(ExchangeError::Timeout)));
    }

    #[tokio::test]
    async fn test_calls_are_spaced() {
        let exchange = Arc::new(PaperExchange::new());
        exchange.add_market(PaperExchange::spot_market("BTC/USDT", 3, 2, dec!(0.001)));
        exchange.set_price("BTC/USDT", dec!(100));

        let session = session(exchange, 1_000, 50);
        let started = Instant::now();
        for _ in 0..3 {
            session.fetch_last_price("BTC/USDT").await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_market_cache_fills_on_load() {
        let exchange = Arc::new(PaperExchange::new());
        exchange.add_market(PaperExchange::spot_market("BTC/USDT", 3, 2, dec!(0.001)));

        let session = session(exchange, 1_000, 0);
        assert!(session.cached_market("BTC/USDT").is_none());
        let market = session.load_market("BTC/USDT").await.unwrap();
        assert_eq!(session.cached_market("BTC/USDT"), Some(market));

        let missing = session.load_market("DOGE/USDT").await;
        assert!(matches!(missing, Err(ExchangeError::MarketNotFound(_))));
    }
}

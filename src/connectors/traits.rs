use crate::config::AccountConfig;
use crate::error::ExchangeError;
use crate::types::{MarketSnapshot, OrderResponse, OrderUpdate, Side};
use crate::utils::precision::{floor_to_step, round_to_tick};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Everything the bot needs from an exchange account.
///
/// Implementations report "order not found" and "insufficient funds" through
/// their own `ExchangeError` variants so callers can react to them.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &str;

    async fn load_market(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError>;

    async fn fetch_last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Result<OrderResponse, ExchangeError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
    ) -> Result<OrderResponse, ExchangeError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError>;

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<OrderUpdate, ExchangeError>;

    // Rounding rules are exchange specific; these defaults match spot LOT_SIZE/PRICE_FILTER.
    fn amount_to_precision(&self, market: &MarketSnapshot, amount: Decimal) -> Decimal {
        floor_to_step(amount, market.amount_step)
    }

    fn price_to_precision(&self, market: &MarketSnapshot, price: Decimal) -> Decimal {
        round_to_tick(price, market.price_tick)
    }
}

/// Opens a client for one set of account credentials.
pub trait ExchangeConnector: Send + Sync {
    fn connect(&self, account: &AccountConfig) -> Result<Arc<dyn ExchangeClient>, ExchangeError>;
}

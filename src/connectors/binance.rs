// src/connectors/binance.rs
use crate::config::AccountConfig;
use crate::connectors::messages::{
    ApiErrorBody, ExchangeInfo, OrderPayload, SymbolFilter, SymbolInfo, TickerPrice,
};
use crate::connectors::traits::{ExchangeClient, ExchangeConnector};
use crate::error::ExchangeError;
use crate::types::{MarketSnapshot, OrderResponse, OrderStatus, OrderUpdate, Side};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

const PROD_REST_URL: &str = "https://api.binance.com";
const TESTNET_REST_URL: &str = "https://testnet.binance.vision";

/// Binance spot REST client. Symbols are accepted in `BASE/QUOTE` form.
pub struct BinanceClient {
    api_key: String,
    secret_key: String,
    http_client: Client,
    base_rest_url: String,
}

impl BinanceClient {
    pub fn new(api_key: String, secret_key: String, testnet: bool) -> Self {
        let base_rest_url = if testnet {
            TESTNET_REST_URL
        } else {
            PROD_REST_URL
        };
        Self {
            api_key,
            secret_key,
            http_client: Client::new(),
            base_rest_url: base_rest_url.to_string(),
        }
    }

    /// Client for market data only; signed endpoints will be rejected.
    pub fn public(testnet: bool) -> Self {
        Self::new(String::new(), String::new(), testnet)
    }

    fn sign_and_build_query(&self, params: Vec<(&str, String)>) -> Result<String, ExchangeError> {
        let mut params = params;
        let timestamp = Utc::now().timestamp_millis().to_string();
        params.push(("timestamp", timestamp));

        let query_string = serde_urlencoded::to_string(&params)
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;
        let signature = sign(&self.secret_key, &query_string)?;

        Ok(format!("{}&signature={}", query_string, signature))
    }

    async fn send_signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        let full_query = self.sign_and_build_query(params)?;
        let url = format!("{}{}?{}", self.base_rest_url, endpoint, full_query);

        let response = self
            .http_client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        read_response(response).await
    }

    async fn send_public_request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_rest_url, endpoint);
        let response = self.http_client.get(&url).query(params).send().await?;
        read_response(response).await
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: &str,
        amount: Decimal,
        price: Option<Decimal>,
    ) -> Result<OrderResponse, ExchangeError> {
        let mut params = vec![
            ("symbol", exchange_symbol(symbol)),
            ("side", side_param(side).to_string()),
            ("type", order_type.to_string()),
            ("quantity", amount.normalize().to_string()),
            ("newClientOrderId", uuid::Uuid::new_v4().simple().to_string()),
        ];
        if let Some(p) = price {
            params.push(("price", p.normalize().to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }

        info!(
            "🚀 Sending Order: {} {} {} {} @ {:?}",
            order_type, side, amount, symbol, price
        );

        let resp: OrderPayload = self
            .send_signed_request(Method::POST, "/api/v3/order", params)
            .await?;

        Ok(OrderResponse {
            id: resp.order_id.to_string(),
            symbol: symbol.to_string(),
            status: map_status(&resp.status)?,
        })
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn name(&self) -> &str {
        "binance"
    }

    async fn load_market(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError> {
        let wire_symbol = exchange_symbol(symbol);
        let info: ExchangeInfo = self
            .send_public_request("/api/v3/exchangeInfo", &[("symbol", wire_symbol.as_str())])
            .await
            .map_err(|err| match err {
                ExchangeError::MarketNotFound(_) => ExchangeError::MarketNotFound(symbol.to_string()),
                other => other,
            })?;

        let symbol_info = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == wire_symbol)
            .ok_or_else(|| ExchangeError::MarketNotFound(symbol.to_string()))?;
        Ok(to_market(symbol, symbol_info))
    }

    async fn fetch_last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let wire_symbol = exchange_symbol(symbol);
        let ticker: TickerPrice = self
            .send_public_request("/api/v3/ticker/price", &[("symbol", wire_symbol.as_str())])
            .await?;
        debug!("{} last price {}", ticker.symbol, ticker.price);
        Ok(ticker.price)
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Result<OrderResponse, ExchangeError> {
        self.place_order(symbol, side, "LIMIT", amount, Some(price))
            .await
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
    ) -> Result<OrderResponse, ExchangeError> {
        self.place_order(symbol, side, "MARKET", amount, None).await
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol", exchange_symbol(symbol)),
            ("orderId", order_id.to_string()),
        ];
        let _: OrderPayload = self
            .send_signed_request(Method::DELETE, "/api/v3/order", params)
            .await
            .map_err(|err| match err {
                ExchangeError::OrderNotFound(_) => ExchangeError::OrderNotFound(order_id.to_string()),
                other => other,
            })?;
        info!("Order {} cancelled", order_id);
        Ok(())
    }

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<OrderUpdate, ExchangeError> {
        let params = vec![
            ("symbol", exchange_symbol(symbol)),
            ("orderId", order_id.to_string()),
        ];
        let order: OrderPayload = self
            .send_signed_request(Method::GET, "/api/v3/order", params)
            .await
            .map_err(|err| match err {
                ExchangeError::OrderNotFound(_) => ExchangeError::OrderNotFound(order_id.to_string()),
                other => other,
            })?;
        to_update(order)
    }
}

/// Opens a [`BinanceClient`] per configured account.
pub struct BinanceConnector;

impl ExchangeConnector for BinanceConnector {
    fn connect(&self, account: &AccountConfig) -> Result<Arc<dyn ExchangeClient>, ExchangeError> {
        if !account.exchange.eq_ignore_ascii_case("binance") {
            return Err(ExchangeError::Unsupported(account.exchange.clone()));
        }
        info!(
            "Connecting to Binance ({})",
            if account.testnet { "testnet" } else { "production" }
        );
        Ok(Arc::new(BinanceClient::new(
            account.api_key.clone(),
            account.secret_key.clone(),
            account.testnet,
        )))
    }
}

fn sign(secret_key: &str, payload: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| ExchangeError::Parse("invalid secret key length".to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

async fn read_response<T: DeserializeOwned>(response: Response) -> Result<T, ExchangeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let body = response.text().await?;
    Err(classify_api_error(status.as_u16(), &body))
}

/// Binance returns errors as `{"code": -1000, "msg": "..."}`.
fn classify_api_error(http_status: u16, body: &str) -> ExchangeError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) => match err.code {
            -2010 => ExchangeError::InsufficientFunds(err.msg),
            -2011 | -2013 => ExchangeError::OrderNotFound(err.msg),
            -1121 => ExchangeError::MarketNotFound(err.msg),
            code => ExchangeError::Api {
                code,
                message: err.msg,
            },
        },
        Err(_) => ExchangeError::Api {
            code: i64::from(http_status),
            message: body.to_string(),
        },
    }
}

/// `BTC/USDT` -> `BTCUSDT`
pub fn exchange_symbol(symbol: &str) -> String {
    symbol.replace('/', "").to_uppercase()
}

fn side_param(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn map_side(side: &str) -> Option<Side> {
    match side {
        "BUY" => Some(Side::Buy),
        "SELL" => Some(Side::Sell),
        _ => None,
    }
}

fn map_status(status: &str) -> Result<OrderStatus, ExchangeError> {
    match status {
        "NEW" | "PARTIALLY_FILLED" | "PENDING_NEW" => Ok(OrderStatus::Open),
        "FILLED" => Ok(OrderStatus::Closed),
        "CANCELED" | "PENDING_CANCEL" | "EXPIRED" | "EXPIRED_IN_MATCH" => Ok(OrderStatus::Canceled),
        "REJECTED" => Ok(OrderStatus::Rejected),
        other => Err(ExchangeError::Parse(format!("unknown order status {}", other))),
    }
}

fn to_market(symbol: &str, info: SymbolInfo) -> MarketSnapshot {
    let mut market = MarketSnapshot {
        symbol: symbol.to_string(),
        base: info.base_asset,
        quote: info.quote_asset,
        amount_step: Decimal::ZERO,
        price_tick: Decimal::ZERO,
        min_amount: Decimal::ZERO,
        min_cost: Decimal::ZERO,
        active: info.status == "TRADING",
    };
    for filter in info.filters {
        match filter {
            SymbolFilter::LotSize { min_qty, step_size } => {
                market.min_amount = min_qty.normalize();
                market.amount_step = step_size.normalize();
            }
            SymbolFilter::PriceFilter { tick_size } => market.price_tick = tick_size.normalize(),
            SymbolFilter::Notional { min_notional } | SymbolFilter::MinNotional { min_notional } => {
                market.min_cost = min_notional.normalize()
            }
            SymbolFilter::Other => {}
        }
    }
    market
}

fn to_update(order: OrderPayload) -> Result<OrderUpdate, ExchangeError> {
    let filled = order.executed_qty.unwrap_or_default();
    let limit_price = order.price.unwrap_or_default();
    // Market orders report price 0; derive the average fill price instead.
    let price = match order.cummulative_quote_qty {
        Some(quote) if limit_price.is_zero() && !filled.is_zero() => quote / filled,
        _ => limit_price,
    };
    Ok(OrderUpdate {
        id: order.order_id.to_string(),
        status: map_status(&order.status)?,
        side: order.side.as_deref().and_then(map_side),
        filled,
        price,
    })
}

// src/config.rs

use crate::error::ConfigError as ParamsError;
use crate::strategies::levels::LevelTable;
use crate::types::StrategyId;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 60_000;

/// Martingale ladder parameters, fixed for the lifetime of a run.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StrategyParams {
    pub initial_price: Decimal,
    pub initial_amount: Decimal,
    pub levels: usize,
    pub price_drop_percent: Decimal,
    pub amount_multiplier: Decimal,
    #[serde(alias = "take_profit")]
    pub take_profit_percent: Decimal,
    #[serde(alias = "stop_loss")]
    pub stop_loss_percent: Decimal,
    #[serde(default)]
    pub check_interval_ms: Option<u64>,
}

impl StrategyParams {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.unwrap_or(DEFAULT_CHECK_INTERVAL_MS))
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.levels == 0 {
            return Err(ParamsError::NoLevels);
        }
        for (field, value) in [
            ("initial_price", self.initial_price),
            ("initial_amount", self.initial_amount),
            ("amount_multiplier", self.amount_multiplier),
        ] {
            if value <= Decimal::ZERO {
                return Err(ParamsError::NotPositive { field, value });
            }
        }
        if self.price_drop_percent < Decimal::ZERO
            || self.price_drop_percent > Decimal::ONE_HUNDRED
        {
            return Err(ParamsError::PriceDropOutOfRange(self.price_drop_percent));
        }
        for (field, value) in [
            ("take_profit_percent", self.take_profit_percent),
            ("stop_loss_percent", self.stop_loss_percent),
        ] {
            if value < Decimal::ZERO {
                return Err(ParamsError::Negative { field, value });
            }
        }
        LevelTable::generate(self)?;
        Ok(())
    }
}

/// API credentials for one exchange account.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AccountConfig {
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub testnet: bool,
}

impl AccountConfig {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.trim().is_empty() && !self.secret_key.trim().is_empty()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StrategyDefinition {
    pub id: StrategyId,
    pub account: String,
    pub symbol: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub params: Option<StrategyParams>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeSettings {
    /// Upper bound for any single exchange call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Minimum gap between two calls on the same session.
    #[serde(default = "default_min_request_spacing_ms")]
    pub min_request_spacing_ms: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            min_request_spacing_ms: default_min_request_spacing_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorSettings {
    #[serde(default = "default_start_delay_ms")]
    pub start_delay_ms: u64,
    #[serde(default = "default_stop_delay_ms")]
    pub stop_delay_ms: u64,
    /// Pause between status fetches of one check-orders batch.
    #[serde(default = "default_order_check_delay_ms")]
    pub order_check_delay_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            start_delay_ms: default_start_delay_ms(),
            stop_delay_ms: default_stop_delay_ms(),
            order_check_delay_ms: default_order_check_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub live_trading: bool,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default)]
    pub exchange: ExchangeSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub accounts: HashMap<String, AccountConfig>,
    #[serde(default)]
    pub strategies: Vec<StrategyDefinition>,
}

impl AppConfig {
    /// `Settings.{toml,yaml,json}` overlaid with `APP__*` environment variables,
    /// e.g. `APP__ACCOUNTS__MAIN__API_KEY`.
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("Settings").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"));

        let config = builder.build()?;
        config.try_deserialize()
    }
}

fn default_exchange() -> String {
    "binance".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_min_request_spacing_ms() -> u64 {
    100
}

fn default_start_delay_ms() -> u64 {
    1_000
}

fn default_stop_delay_ms() -> u64 {
    300
}

fn default_order_check_delay_ms() -> u64 {
    200
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

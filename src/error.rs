//! Error types shared across the bot.

use crate::types::StrategyId;
use rust_decimal::Decimal;
use thiserror::Error;

/// Failures reported by an exchange collaborator.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("market {0} not found")]
    MarketNotFound(String),

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("exchange API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("unsupported exchange: {0}")]
    Unsupported(String),
}

impl ExchangeError {
    /// Failures that are expected to clear up on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("market {0} not found")]
    MarketNotFound(String),

    #[error("level {level} amount {amount} is below the market minimum {minimum}")]
    LevelValidation {
        level: usize,
        amount: Decimal,
        minimum: Decimal,
    },

    #[error("invalid parameters: {0}")]
    Params(#[from] ConfigError),

    #[error("engine not initialized")]
    NotInitialized,

    #[error("market data unavailable: {0}")]
    MarketData(#[source] ExchangeError),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("levels must be at least 1")]
    NoLevels,

    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: Decimal },

    #[error("price_drop_percent must be within 0..=100, got {0}")]
    PriceDropOutOfRange(Decimal),

    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: Decimal },

    #[error("level {level} of the ladder exceeds the representable decimal range")]
    LadderOverflow { level: usize },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("strategy {0} is already active")]
    AlreadyActive(StrategyId),

    #[error("strategy {0} has no parameters")]
    MissingParameters(StrategyId),

    #[error("no usable credentials for account '{0}'")]
    MissingCredentials(String),

    #[error("invalid parameters: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to open exchange session: {0}")]
    Connect(#[source] ExchangeError),

    #[error("strategy {0} failed to initialize")]
    InitializationFailed(StrategyId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub mod binance;
pub mod messages;
pub mod paper;
pub mod session;
pub mod traits;

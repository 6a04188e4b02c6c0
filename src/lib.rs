pub mod config;
pub mod connectors;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;
pub mod strategies;
pub mod types;
pub mod utils;

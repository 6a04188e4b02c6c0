// src/main.rs
use dotenvy::dotenv;
use martingale_bot::config::AppConfig;
use martingale_bot::connectors::binance::{BinanceClient, BinanceConnector};
use martingale_bot::connectors::paper::{PaperConnector, PaperExchange};
use martingale_bot::connectors::traits::ExchangeConnector;
use martingale_bot::core::orchestrator::Orchestrator;
use martingale_bot::logging::init_logging;
use martingale_bot::storage::JsonFileStore;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // 1. Load Configuration
    let config = AppConfig::new()?;
    let _log_guard = init_logging(&config.log_dir);

    let active = config.strategies.iter().filter(|s| s.is_active).count();
    println!("========================================");
    println!("       MARTINGALE BOT - v0.1.0");
    println!("========================================");
    println!("Strategies: {} configured, {} active", config.strategies.len(), active);
    println!(
        "Mode:       {}",
        if config.live_trading {
            "🚨 LIVE TRADING"
        } else {
            "📝 PAPER TRADING"
        }
    );
    println!("State dir:  {}", config.state_dir);
    println!("========================================");

    // 2. Initialize Components
    // Paper mode fills orders locally against live public prices.
    let connector: Arc<dyn ExchangeConnector> = if config.live_trading {
        Arc::new(BinanceConnector)
    } else {
        let market_data = Arc::new(BinanceClient::public(false));
        Arc::new(PaperConnector::new(Arc::new(
            PaperExchange::with_market_data(market_data),
        )))
    };
    let store = Arc::new(JsonFileStore::new(&config.state_dir));
    let mut orchestrator = Orchestrator::new(&config, connector, store);

    // 3. Start Strategies
    let started = orchestrator.start_all(&config.strategies).await;
    info!("{} of {} active strategies running", started, active);

    // 4. Wait for Shutdown
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received, stopping strategies...");
    orchestrator.stop_all(true, false).await;

    Ok(())
}

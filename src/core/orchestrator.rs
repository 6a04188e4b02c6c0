// src/core/orchestrator.rs
//! Registry and lifecycle of running strategies.

use crate::config::{AccountConfig, AppConfig, ExchangeSettings, OrchestratorSettings, StrategyDefinition};
use crate::connectors::session::ExchangeSession;
use crate::connectors::traits::ExchangeConnector;
use crate::core::worker::{StrategyWorker, WorkerHandle};
use crate::error::OrchestratorError;
use crate::storage::SnapshotStore;
use crate::strategies::martingale::MartingaleEngine;
use crate::strategies::state::StateUpdate;
use crate::types::StrategyId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

struct ActiveStrategy {
    handle: WorkerHandle,
    session: Arc<ExchangeSession>,
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    exchange_settings: ExchangeSettings,
    accounts: HashMap<String, AccountConfig>,
    connector: Arc<dyn ExchangeConnector>,
    store: Arc<dyn SnapshotStore>,
    registry: HashMap<StrategyId, ActiveStrategy>,
    sessions: HashMap<String, Arc<ExchangeSession>>,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        connector: Arc<dyn ExchangeConnector>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            settings: config.orchestrator.clone(),
            exchange_settings: config.exchange.clone(),
            accounts: config.accounts.clone(),
            connector,
            store,
            registry: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Ids of strategies whose worker is still running.
    pub fn active_ids(&self) -> Vec<StrategyId> {
        let mut ids: Vec<StrategyId> = self
            .registry
            .iter()
            .filter(|(_, active)| !active.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_active(&self, strategy_id: StrategyId) -> bool {
        self.registry
            .get(&strategy_id)
            .map_or(false, |active| !active.handle.is_finished())
    }

    pub async fn start_instance(
        &mut self,
        definition: &StrategyDefinition,
    ) -> Result<(), OrchestratorError> {
        self.reap_finished().await;
        let strategy_id = definition.id;

        if self.registry.contains_key(&strategy_id) {
            warn!(strategy_id, symbol = %definition.symbol, "Strategy is already running");
            return Err(OrchestratorError::AlreadyActive(strategy_id));
        }
        let Some(params) = definition.params.clone() else {
            error!(strategy_id, "Cannot start strategy: parameters missing");
            return Err(OrchestratorError::MissingParameters(strategy_id));
        };
        info!(
            strategy_id,
            symbol = %definition.symbol,
            account = %definition.account,
            "Starting strategy..."
        );

        if let Err(err) = params.validate() {
            error!(strategy_id, "Invalid strategy parameters: {}", err);
            self.mark_halted(strategy_id, format!("invalid parameters: {}", err))
                .await;
            return Err(err.into());
        }

        let session = match self.session_for(&definition.account) {
            Ok(session) => session,
            Err(err) => {
                error!(strategy_id, "Cannot open exchange session: {}", err);
                self.mark_halted(strategy_id, err.to_string()).await;
                return Err(err);
            }
        };

        let restored = self.store.load(strategy_id).await?;
        let engine = MartingaleEngine::new(
            strategy_id,
            definition.symbol.clone(),
            params,
            session.clone(),
            restored,
        );
        let mut worker = StrategyWorker::new(
            engine,
            session.clone(),
            self.store.clone(),
            Duration::from_millis(self.settings.order_check_delay_ms),
        );

        // The worker already persisted the failure reason.
        if !worker.initialize().await {
            error!(strategy_id, "Strategy failed to initialize");
            return Err(OrchestratorError::InitializationFailed(strategy_id));
        }

        let handle = worker.spawn();
        self.registry
            .insert(strategy_id, ActiveStrategy { handle, session });
        info!(strategy_id, symbol = %definition.symbol, "Strategy started");
        Ok(())
    }

    pub async fn stop_instance(
        &mut self,
        strategy_id: StrategyId,
        cancel_orders: bool,
        sell_position: bool,
    ) -> Result<(), OrchestratorError> {
        match self.registry.remove(&strategy_id) {
            Some(active) => {
                info!(strategy_id, "Stopping strategy...");
                active.handle.stop(cancel_orders, sell_position).await;
                info!(strategy_id, "Strategy stopped and removed from registry");
                Ok(())
            }
            None => {
                warn!(strategy_id, "Strategy is not running or unknown");
                self.store
                    .apply(strategy_id, &StateUpdate::running(false))
                    .await?;
                Ok(())
            }
        }
    }

    /// Start every active definition, pausing between starts. Returns how
    /// many came up.
    pub async fn start_all(&mut self, definitions: &[StrategyDefinition]) -> usize {
        let active: Vec<&StrategyDefinition> =
            definitions.iter().filter(|d| d.is_active).collect();
        info!("Found {} active strategies to start", active.len());

        let delay = Duration::from_millis(self.settings.start_delay_ms);
        let mut started = 0;
        for (i, definition) in active.into_iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match self.start_instance(definition).await {
                Ok(()) => started += 1,
                Err(e) => error!(strategy_id = definition.id, "Failed to start strategy: {}", e),
            }
        }
        started
    }

    /// Stop everything in the registry, one at a time.
    pub async fn stop_all(&mut self, cancel_orders: bool, sell_position: bool) {
        info!("Stopping all active strategies...");
        let mut ids: Vec<StrategyId> = self.registry.keys().copied().collect();
        ids.sort_unstable();

        let delay = Duration::from_millis(self.settings.stop_delay_ms);
        for (i, strategy_id) in ids.into_iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = self
                .stop_instance(strategy_id, cancel_orders, sell_position)
                .await
            {
                error!(strategy_id, "Failed to stop strategy: {}", e);
            }
        }
        info!("All strategies stopped");
    }

    /// Drop workers that exited on their own (stop-loss, fatal errors).
    async fn reap_finished(&mut self) {
        let finished: Vec<StrategyId> = self
            .registry
            .iter()
            .filter(|(_, active)| active.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for strategy_id in finished {
            if let Some(active) = self.registry.remove(&strategy_id) {
                info!(
                    strategy_id = active.handle.strategy_id(),
                    account = active.session.account(),
                    "Removing finished strategy from registry"
                );
                active.handle.stop(false, false).await;
            }
        }
    }

    fn session_for(&mut self, account_name: &str) -> Result<Arc<ExchangeSession>, OrchestratorError> {
        if let Some(session) = self.sessions.get(account_name) {
            return Ok(session.clone());
        }
        let account = self
            .accounts
            .get(account_name)
            .filter(|account| account.has_credentials())
            .ok_or_else(|| OrchestratorError::MissingCredentials(account_name.to_string()))?;

        let client = self
            .connector
            .connect(account)
            .map_err(OrchestratorError::Connect)?;
        let session = Arc::new(ExchangeSession::new(
            account_name,
            client,
            Duration::from_millis(self.exchange_settings.request_timeout_ms),
            Duration::from_millis(self.exchange_settings.min_request_spacing_ms),
        ));
        info!(
            account = account_name,
            exchange = session.exchange_name(),
            "Exchange session opened"
        );
        self.sessions
            .insert(account_name.to_string(), session.clone());
        Ok(session)
    }

    async fn mark_halted(&self, strategy_id: StrategyId, reason: String) {
        if let Err(e) = self
            .store
            .apply(strategy_id, &StateUpdate::halted(reason))
            .await
        {
            error!(strategy_id, "Failed to save state: {}", e);
        }
    }
}

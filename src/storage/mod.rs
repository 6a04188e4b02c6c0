//! Persistence of per-strategy snapshots.
//!
//! Engines never write storage themselves; the worker applies every
//! `StateUpdate` it drains through a [`SnapshotStore`].

use crate::error::StorageError;
use crate::strategies::state::{EngineState, StateUpdate};
use crate::types::StrategyId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, strategy_id: StrategyId) -> Result<Option<EngineState>, StorageError>;

    /// Merge a partial update into the stored snapshot, creating it if needed.
    async fn apply(&self, strategy_id: StrategyId, update: &StateUpdate) -> Result<(), StorageError>;
}

/// One pretty-printed JSON file per strategy: `<dir>/strategy-<id>.json`.
pub struct JsonFileStore {
    dir: PathBuf,
    // read-modify-write must not interleave between workers
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, strategy_id: StrategyId) -> PathBuf {
        self.dir.join(format!("strategy-{}.json", strategy_id))
    }

    async fn read(&self, strategy_id: StrategyId) -> Result<Option<EngineState>, StorageError> {
        match tokio::fs::read_to_string(self.path_for(strategy_id)).await {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self, strategy_id: StrategyId) -> Result<Option<EngineState>, StorageError> {
        let state = self.read(strategy_id).await?;
        if state.is_some() {
            info!("Restored snapshot for strategy {}", strategy_id);
        }
        Ok(state)
    }

    async fn apply(&self, strategy_id: StrategyId, update: &StateUpdate) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.read(strategy_id).await?.unwrap_or_default();
        state.apply(update);

        tokio::fs::create_dir_all(&self.dir).await?;
        let data = serde_json::to_string_pretty(&state)?;
        tokio::fs::write(self.path_for(strategy_id), data).await?;
        debug!("💾 Snapshot saved for strategy {}", strategy_id);
        Ok(())
    }
}

/// Keeps snapshots in memory. Used for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryStore {
    states: StdMutex<HashMap<StrategyId, EngineState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, strategy_id: StrategyId) -> Option<EngineState> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&strategy_id)
            .cloned()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self, strategy_id: StrategyId) -> Result<Option<EngineState>, StorageError> {
        Ok(self.get(strategy_id))
    }

    async fn apply(&self, strategy_id: StrategyId, update: &StateUpdate) -> Result<(), StorageError> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(strategy_id)
            .or_default()
            .apply(update);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderTag, Position};
    use rust_decimal_macros::dec;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("martingale-store-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_json_store_merges_partial_updates() {
        let dir = temp_dir();
        let store = JsonFileStore::new(&dir);
        assert!(store.load(7).await.unwrap().is_none());

        store.apply(7, &StateUpdate::running(true)).await.unwrap();
        let mut state = EngineState::default();
        state.positions.push(Position {
            price: dec!(100),
            amount: dec!(1),
            level: 0,
        });
        state.open_orders.insert("42".to_string(), OrderTag::TakeProfit);
        state.take_profit_order_id = Some("42".to_string());
        store.apply(7, &StateUpdate::position(&state)).await.unwrap();
        store.apply(7, &StateUpdate::orders(&state)).await.unwrap();

        let loaded = store.load(7).await.unwrap().unwrap();
        assert!(loaded.is_running);
        assert_eq!(loaded.positions, state.positions);
        assert_eq!(loaded.take_profit_order_id.as_deref(), Some("42"));
        assert_eq!(loaded.open_orders.get("42"), Some(&OrderTag::TakeProfit));

        let raw = tokio::fs::read_to_string(dir.join("strategy-7.json")).await.unwrap();
        assert!(raw.contains("\"isRunning\": true"));

        store.apply(7, &StateUpdate::halted("boom")).await.unwrap();
        let loaded = store.load(7).await.unwrap().unwrap();
        assert!(!loaded.is_running);
        assert_eq!(loaded.last_error.as_deref(), Some("boom"));
        assert_eq!(loaded.positions.len(), 1);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_json_store_rejects_corrupt_file() {
        let dir = temp_dir();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("strategy-3.json"), "{not json").await.unwrap();

        let store = JsonFileStore::new(&dir);
        assert!(matches!(store.load(3).await, Err(StorageError::Serde(_))));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_memory_store_creates_on_first_update() {
        let store = MemoryStore::new();
        store.apply(1, &StateUpdate::running(false)).await.unwrap();
        let state = store.get(1).unwrap();
        assert!(!state.is_running);
        assert!(state.positions.is_empty());
    }
}

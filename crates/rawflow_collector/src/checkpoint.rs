//! Checkpoint store seam.

use async_trait::async_trait;
use rawflow_db::RawflowDb;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;

pub use rawflow_db::CheckpointState;

/// Durable record of the last successful collection window per params key.
///
/// `commit` replaces the whole state for its key or nothing at all. Two
/// commits for the same key race last-writer-wins; the run guard keeps
/// that from happening within one process.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, params_key: &str) -> Result<Option<CheckpointState>>;

    async fn commit(&self, state: CheckpointState) -> Result<()>;
}

#[async_trait]
impl CheckpointStore for RawflowDb {
    async fn load(&self, params_key: &str) -> Result<Option<CheckpointState>> {
        Ok(self.checkpoint_load(params_key).await?)
    }

    async fn commit(&self, state: CheckpointState) -> Result<()> {
        Ok(self.checkpoint_commit(&state).await?)
    }
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    states: Mutex<HashMap<String, CheckpointState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, params_key: &str) -> Option<CheckpointState> {
        self.lock().get(params_key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CheckpointState>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, params_key: &str) -> Result<Option<CheckpointState>> {
        Ok(self.get(params_key))
    }

    async fn commit(&self, state: CheckpointState) -> Result<()> {
        let mut states = self.lock();
        let created_at = states
            .get(&state.params_key)
            .map(|prev| prev.created_at)
            .unwrap_or(state.created_at);
        states.insert(
            state.params_key.clone(),
            CheckpointState { created_at, ..state },
        );
        Ok(())
    }
}

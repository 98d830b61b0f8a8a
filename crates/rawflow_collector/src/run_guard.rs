//! At most one run per params key.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::error::{CollectError, Result};

/// Set of params keys with a run in flight. Clones share the set.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl RunRegistry {
    /// A private registry. Only runs sharing it exclude each other.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry. Collectors use it unless given another.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<RunRegistry> = OnceLock::new();
        GLOBAL.get_or_init(RunRegistry::new).clone()
    }

    /// Claim `params_key`, or fail fast with `AlreadyRunning`.
    ///
    /// The claim is released when the returned guard drops.
    pub fn try_acquire(&self, params_key: &str) -> Result<RunGuard> {
        if !lock(&self.active).insert(params_key.to_string()) {
            return Err(CollectError::AlreadyRunning(params_key.to_string()));
        }
        Ok(RunGuard {
            active: Arc::clone(&self.active),
            params_key: params_key.to_string(),
        })
    }

    pub fn is_running(&self, params_key: &str) -> bool {
        lock(&self.active).contains(params_key)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }
}

#[derive(Debug)]
pub struct RunGuard {
    active: Arc<Mutex<HashSet<String>>>,
    params_key: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.params_key);
    }
}

fn lock(active: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

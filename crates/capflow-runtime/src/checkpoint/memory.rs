//! In-memory checkpoint store for tests and dry runs

use super::{Checkpoint, CheckpointError, CheckpointKey, CheckpointStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Checkpoint store backed by a map
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<BTreeMap<CheckpointKey, Checkpoint>>,
    persists: Mutex<Vec<CheckpointKey>>,
    fail_persist: AtomicBool,
    fail_load: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `persist` fail
    pub fn fail_persists(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `load` and `clear` fail
    pub fn fail_loads(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    fn check_load(&self) -> Result<(), CheckpointError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(CheckpointError::store("load rejected"));
        }
        Ok(())
    }

    /// Keys in the order they were persisted
    pub fn persist_log(&self) -> Vec<CheckpointKey> {
        self.persists.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<CheckpointKey, Checkpoint>>, CheckpointError>
    {
        self.checkpoints
            .lock()
            .map_err(|e| CheckpointError::store(format!("Checkpoint map poisoned: {}", e)))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, CheckpointError> {
        self.check_load()?;
        Ok(self.lock()?.get(key).cloned())
    }

    async fn persist(
        &self,
        key: &CheckpointKey,
        checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointError> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(CheckpointError::store("persist rejected"));
        }
        self.lock()?.insert(key.clone(), checkpoint.clone());
        if let Ok(mut log) = self.persists.lock() {
            log.push(key.clone());
        }
        Ok(())
    }

    async fn clear(&self, key: &CheckpointKey) -> Result<bool, CheckpointError> {
        self.check_load()?;
        Ok(self.lock()?.remove(key).is_some())
    }

    async fn list(
        &self,
        capture: Option<&str>,
    ) -> Result<Vec<(CheckpointKey, Checkpoint)>, CheckpointError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|(key, _)| capture.map_or(true, |c| key.capture == c))
            .map(|(key, cp)| (key.clone(), cp.clone()))
            .collect())
    }
}

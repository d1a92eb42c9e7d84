//! Worker registry: at most one live account worker per identity.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use super::account::{AccountWorker, WorkerDeps};
use super::handle::WorkerHandle;
use crate::error::WorkerError;
use crate::identity::IdentityKey;

/// Per-identity slot. Its lock is held while that identity's worker is built,
/// replaced or torn down.
type Slot = Arc<Mutex<Option<WorkerHandle>>>;

pub struct WorkerRegistry {
    deps: WorkerDeps,
    /// Only held long enough to look up or insert a slot.
    slots: Mutex<HashMap<IdentityKey, Slot>>,
    halt: broadcast::Sender<()>,
}

impl WorkerRegistry {
    pub fn new(deps: WorkerDeps) -> Self {
        let (halt, _) = broadcast::channel(1);
        Self {
            deps,
            slots: Mutex::new(HashMap::new()),
            halt,
        }
    }

    /// Return the live worker for `key`, building and starting one if needed.
    pub async fn get_or_create(&self, key: IdentityKey) -> Result<WorkerHandle, WorkerError> {
        let slot = self.slot(key).await;
        let mut current = slot.lock().await;
        if let Some(handle) = current.as_ref() {
            if handle.is_running() {
                return Ok(handle.clone());
            }
            debug!(remote_id = %key.remote_id, "Replacing stopped worker");
        }

        let handle = self.spawn(key).await?;
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Build and start a fresh worker, replacing any existing one.
    ///
    /// A live predecessor is stopped and must exit before its replacement
    /// starts.
    pub async fn create(&self, key: IdentityKey) -> Result<WorkerHandle, WorkerError> {
        let slot = self.slot(key).await;
        let mut current = slot.lock().await;
        if let Some(previous) = current.take() {
            debug!(remote_id = %key.remote_id, "Stopping replaced worker");
            if let Err(e) = self.retire(&previous).await {
                *current = Some(previous);
                return Err(e);
            }
        }

        let handle = self.spawn(key).await?;
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Stop and deregister the worker for `key`, waiting for it to exit.
    /// Returns whether one was registered.
    pub async fn remove(&self, key: IdentityKey) -> Result<bool, WorkerError> {
        let Some(slot) = self.slots.lock().await.get(&key).cloned() else {
            return Ok(false);
        };
        let mut current = slot.lock().await;
        let Some(handle) = current.take() else {
            return Ok(false);
        };
        if let Err(e) = self.retire(&handle).await {
            *current = Some(handle);
            return Err(e);
        }
        info!(user_id = %key.user_id, remote_id = %key.remote_id, "Worker removed");
        Ok(true)
    }

    /// The live worker for `key`, if any.
    pub async fn get(&self, key: IdentityKey) -> Option<WorkerHandle> {
        let slot = self.slots.lock().await.get(&key).cloned()?;
        let current = slot.lock().await;
        current.as_ref().filter(|h| h.is_running()).cloned()
    }

    /// Number of live workers.
    pub async fn len(&self) -> usize {
        let mut live = 0;
        for slot in self.all_slots().await {
            if slot.lock().await.as_ref().is_some_and(|h| h.is_running()) {
                live += 1;
            }
        }
        live
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Halt every worker and empty the registry.
    pub async fn shutdown_all(&self) {
        let _ = self.halt.send(());
        for slot in self.all_slots().await {
            if let Some(handle) = slot.lock().await.take() {
                handle.stop();
            }
        }
        info!("All workers halted");
    }

    async fn slot(&self, key: IdentityKey) -> Slot {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(key).or_default())
    }

    async fn all_slots(&self) -> Vec<Slot> {
        self.slots.lock().await.values().cloned().collect()
    }

    /// Stop `handle` and wait, bounded, for its desk loop to exit.
    async fn retire(&self, handle: &WorkerHandle) -> Result<(), WorkerError> {
        handle.stop();
        let budget = self.deps.config.stop_timeout;
        if tokio::time::timeout(budget, handle.closed()).await.is_err() {
            warn!(key = %handle.key(), "Worker did not stop in time");
            return Err(WorkerError::StopTimeout {
                key: handle.key().to_string(),
                timeout: budget,
            });
        }
        Ok(())
    }

    async fn spawn(&self, key: IdentityKey) -> Result<WorkerHandle, WorkerError> {
        let worker = AccountWorker::new(key, self.deps.clone()).await?;
        let handle = worker.start(self.halt.subscribe());
        info!(user_id = %key.user_id, remote_id = %key.remote_id, "Worker started");
        Ok(handle)
    }
}

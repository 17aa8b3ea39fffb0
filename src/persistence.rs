//! Optional state persistence for infrastructure primitives
//!
//! Breakers, limiters, caches, and the scheduler can be handed a
//! [`StatePersistence`] collaborator so their state survives process
//! restarts. The schema per primitive is fixed by the snapshot it stores.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Failure while loading or storing persisted state. These never surface as
/// operation failures; callers log and continue.
#[derive(Debug, thiserror::Error)]
#[error("persistence failed: {message}")]
pub struct PersistenceError {
    pub message: String,
}

impl PersistenceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Contract for persisting primitive state under a named key.
#[async_trait]
pub trait StatePersistence: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Value>, PersistenceError>;

    async fn store(&self, key: &str, state: Value) -> Result<(), PersistenceError>;

    /// Atomically replace the state under `key` with the result of `op`
    /// applied to the current state.
    async fn transaction(
        &self,
        key: &str,
        op: Box<dyn FnOnce(Option<Value>) -> Value + Send>,
    ) -> Result<Value, PersistenceError>;
}

/// In-memory persistence used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryPersistence {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl StatePersistence for MemoryPersistence {
    async fn load(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn store(&self, key: &str, state: Value) -> Result<(), PersistenceError> {
        self.entries.lock().await.insert(key.to_string(), state);
        Ok(())
    }

    async fn transaction(
        &self,
        key: &str,
        op: Box<dyn FnOnce(Option<Value>) -> Value + Send>,
    ) -> Result<Value, PersistenceError> {
        let mut entries = self.entries.lock().await;
        let next = op(entries.get(key).cloned());
        entries.insert(key.to_string(), next.clone());
        Ok(next)
    }
}

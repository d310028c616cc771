use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

/// Shared in-memory key-value map.
///
/// Cloning the handle is cheap and every clone sees the same map. Readers
/// run concurrently; a `set` takes the write half of the lock, so no caller
/// ever observes a half-applied write.
#[derive(Clone, Debug, Default)]
pub struct KeyValueStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let store = self.inner.read().await;
        store.get(key).cloned()
    }

    /// Inserts or overwrites `key`, returning the value it replaced.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let mut store = self.inner.write().await;
        store.insert(key.into(), value.into())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

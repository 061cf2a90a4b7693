//! In-process counter store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CounterError, CounterStore};

/// Counters kept in memory for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: RwLock<HashMap<String, i64>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current total for `key`.
    pub async fn get(&self, key: &str) -> Option<i64> {
        self.counters.read().await.get(key).copied()
    }

    /// Copy of every counter.
    pub async fn snapshot(&self) -> HashMap<String, i64> {
        self.counters.read().await.clone()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_by(&self, key: &str, delta: u64) -> Result<i64, CounterError> {
        let delta = i64::try_from(delta)
            .map_err(|_| CounterError::Protocol(format!("delta {delta} out of range")))?;

        let mut counters = self.counters.write().await;
        let total = counters.entry(key.to_string()).or_insert(0);
        *total = total.saturating_add(delta);
        Ok(*total)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_accumulates_per_key() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.increment_by("a", 3).await.unwrap(), 3);
        assert_eq!(store.increment_by("a", 4).await.unwrap(), 7);
        assert_eq!(store.increment_by("b", 1).await.unwrap(), 1);

        assert_eq!(store.get("a").await, Some(7));
        assert_eq!(store.get("missing").await, None);
        assert_eq!(store.snapshot().await.len(), 2);
    }
}

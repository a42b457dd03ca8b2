//! In-memory storage backends.
//!
//! The same type serves both roles: a long-lived instance is the durable
//! store, a per-tab instance is the session-scoped store. An optional byte
//! capacity simulates host storage quotas.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::{ErrorKind, StorageBackend, WalletError};

/// Thread-safe in-memory key-value store.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
    capacity_bytes: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that rejects writes once total value bytes exceed `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity_bytes: Some(capacity),
        }
    }

    fn used_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.key().len() + e.value().len())
            .sum()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, WalletError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), WalletError> {
        if let Some(capacity) = self.capacity_bytes {
            let existing = self.entries.get(key).map(|e| e.value().len()).unwrap_or(0);
            let projected = self.used_bytes() - existing + key.len() + value.len();
            if projected > capacity {
                return Err(WalletError::new(
                    ErrorKind::UnknownError,
                    format!("storage quota exceeded ({projected} > {capacity} bytes)"),
                ));
            }
        }
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), WalletError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, WalletError> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}

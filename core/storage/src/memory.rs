//! In-memory store for testing.

use serde_json::Value;
use std::sync::RwLock;

use crate::store::{Entries, KeyValueStore};
use keepsync_common::{Error, Result};

/// In-memory key-value store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<Entries>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `entries`.
    pub fn with_entries(entries: Entries) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

fn poisoned() -> Error {
    Error::Storage("Memory store lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        Ok(entries.remove(key).is_some())
    }

    fn snapshot(&self) -> Result<Entries> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.clone())
    }

    fn replace(&self, new_entries: Entries) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        *entries = new_entries;
        Ok(())
    }
}

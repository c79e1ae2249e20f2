//! Key-value store trait definition.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use keepsync_common::{Error, Result};

/// Full contents of a store, ordered by key.
pub type Entries = BTreeMap<String, Value>;

/// Key-value store shared by all KeepSync components.
///
/// All operations are synchronous from the caller's perspective so that a
/// component can read, modify and write back a structure without yielding
/// in between.
pub trait KeyValueStore: Send + Sync {
    /// Get the backend name (e.g., "file", "memory").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Postconditions
    /// - The new value is durable when this returns `Ok`
    ///
    /// # Errors
    /// - I/O errors while persisting
    fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove `key`. Returns whether it was present.
    fn remove(&self, key: &str) -> Result<bool>;

    /// Copy of every entry in the store.
    fn snapshot(&self) -> Result<Entries>;

    /// Replace the entire contents of the store in one write.
    fn replace(&self, entries: Entries) -> Result<()>;
}

impl dyn KeyValueStore {
    /// Read and deserialize `key`, falling back to `default` when absent.
    ///
    /// # Errors
    /// - The stored value does not deserialize into `T`
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key)? {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                Error::Serialization(format!("Invalid value under '{}': {}", key, e))
            }),
            None => Ok(default),
        }
    }

    /// Serialize `value` and store it under `key`.
    pub fn set_typed<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value)
    }
}

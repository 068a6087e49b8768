use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::StoreError;
use crate::kv::{decode, KeyValueStore};

/// Process-local `KeyValueStore`. Values go through the same text encoding
/// as the SQLite store so both behave alike.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_raw(&self, key: &str, raw: impl Into<String>) {
        self.entries.lock().insert(key.to_owned(), raw.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.lock().get(key).cloned().map(decode))
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.set_raw(key, serde_json::to_string(value)?);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

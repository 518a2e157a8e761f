//! Typed configuration stored in the key/value collaborator.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use crate::store::KeyValueStore;
use crate::Result;

const CONFIG_PREFIX: &str = "config/";

/// Configuration table: a namespaced view over a [`KeyValueStore`].
#[derive(Clone)]
pub struct Config {
    store: Arc<dyn KeyValueStore>,
}

impl Config {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Get and deserialize the value of `key`, if present.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(&Self::qualify(key))? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Get `key` or fall back to `or_else`.
    ///
    /// Storage and decoding failures are logged and yield the fallback.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, or_else: T) -> T {
        match self.get(key) {
            Ok(Some(value)) => value,
            Ok(None) => or_else,
            Err(e) => {
                error!(key, error = %e, "failed to read configuration key");
                or_else
            }
        }
    }

    /// Set `key` to `value`.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<bool> {
        let value = serde_json::to_value(value)?;
        self.store.set(&Self::qualify(key), value)
    }

    fn qualify(key: &str) -> String {
        format!("{}{}", CONFIG_PREFIX, key)
    }
}

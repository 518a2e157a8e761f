//! Key/value persistence collaborator.
//!
//! The protocol crates only ever need `get(key) -> value` and
//! `set(key, value) -> bool`. Two backends are provided:
//! - [`MemoryStore`] for tests and ephemeral peers
//! - [`JsonFileStore`], a single JSON document rewritten on every `set`

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_json::Value;
use tracing::debug;

use crate::{Error, Result};

/// Minimal key/value table used for configuration and identity storage.
pub trait KeyValueStore: Send + Sync {
    /// Fetch the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store `value` under `key`. Returns `true` once the value is durable.
    fn set(&self, key: &str, value: Value) -> Result<bool>;
}

/// Process-local store backed by a sorted map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.entries.read().map_err(|_| Error::storage("lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<bool> {
        let mut entries = self.entries.write().map_err(|_| Error::storage("lock poisoned"))?;
        entries.insert(key.to_string(), value);
        Ok(true)
    }
}

/// File-backed store: one JSON object, loaded at open and rewritten on change.
///
/// Writes go to a sibling temporary file which is then renamed over the
/// original, so a crash mid-write leaves the previous state intact.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Open (or create on first write) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let text = fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&text)
                    .map_err(|e| Error::storage(format!("{}: {}", path.display(), e)))?
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = entries.len(), "opened store");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<()> {
        let text = serde_json::to_string_pretty(entries)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.entries.read().map_err(|_| Error::storage("lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<bool> {
        let mut entries = self.entries.write().map_err(|_| Error::storage("lock poisoned"))?;
        // Memory only changes once the file does
        let mut updated = entries.clone();
        updated.insert(key.to_string(), value);
        self.persist(&updated)?;
        *entries = updated;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_store_get_set() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").unwrap(), None);

        assert!(store.set("a", json!(1)).unwrap());
        assert_eq!(store.get("a").unwrap(), Some(json!(1)));

        store.set("a", json!({"x": true})).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(json!({"x": true})));
    }

    #[test]
    fn test_file_store_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            store.set("config/remote", json!("key")).unwrap();
            store.set("clients/a/public-key", json!("pem")).unwrap();
        }

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("config/remote").unwrap(), Some(json!("key")));
        assert_eq!(reopened.get("clients/a/public-key").unwrap(), Some(json!("pem")));
    }

    #[test]
    fn test_file_store_failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("state.json");
        let store = JsonFileStore::open(&path).unwrap();

        assert!(store.set("config/remote", json!("key")).is_err());
        assert_eq!(store.get("config/remote").unwrap(), None);
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();

        let result = JsonFileStore::open(&path);
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    #[test]
    fn test_file_store_empty_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get("config/remote").unwrap(), None);
    }
}

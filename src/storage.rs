//! Durable key-value backends.
//!
//! Values are arbitrary JSON. The persisted assignment store and heuristic
//! table are written as JSON *text* (a `Value::String`) under their own keys;
//! preferences are written as plain JSON scalars.

use crate::error::{MemoryError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Asynchronous key-value storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Stable name of the backing location. Two handles with the same
    /// identity see the same data.
    fn identity(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-local storage, mostly useful for tests.
pub struct MemoryStorage {
    identity: String,
    data: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let id = NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            identity: format!("memory:{}", id),
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Storage pre-filled with the given pairs.
    pub fn with_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let storage = Self::new();
        {
            let mut data = storage.lock();
            for (k, v) in values {
                data.insert(k.into(), v);
            }
        }
        storage
    }

    /// Copy of a raw stored value, without going through the async API.
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStorage {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.lock().insert(key.to_string(), value);
        Ok(())
    }
}

/// Storage backed by a single JSON object file.
///
/// The file is read once on first access and rewritten in full on every
/// `set` (write to a sibling temp file, then rename).
pub struct JsonFileStorage {
    identity: String,
    path: PathBuf,
    cache: tokio::sync::Mutex<Option<Map<String, Value>>>,
}

impl JsonFileStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            identity: format!("file:{}", path.display()),
            path,
            cache: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<Map<String, Value>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Storage file {} not found, starting empty", self.path.display());
                return Ok(Map::new());
            }
            Err(source) => return Err(self.io_error(source)),
        };

        if raw.trim().is_empty() {
            return Ok(Map::new());
        }

        let value: Value =
            serde_json::from_str(&raw).map_err(|e| MemoryError::json("storage file", e))?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(MemoryError::Malformed {
                key: self.path.display().to_string(),
                reason: format!("expected a JSON object, found {}", json_kind(&other)),
            }),
        }
    }

    async fn write_file(&self, map: &Map<String, Value>) -> Result<()> {
        let text = serde_json::to_string_pretty(map)
            .map_err(|e| MemoryError::json("storage file", e))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> MemoryError {
        MemoryError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStorage {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.read_file().await?);
        }
        Ok(cache.as_ref().and_then(|map| map.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let mut map = match cache.take() {
            Some(map) => map,
            None => self.read_file().await?,
        };
        let previous = map.insert(key.to_string(), value);
        let written = self.write_file(&map).await;
        if written.is_err() {
            // The cache only ever holds what is on disk.
            match previous {
                Some(previous) => map.insert(key.to_string(), previous),
                None => map.remove(key),
            };
        }
        *cache = Some(map);
        written
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert!(storage.get("missing").await.unwrap().is_none());

        storage.set("k", json!(5)).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(json!(5)));
        assert_eq!(storage.peek("k"), Some(json!(5)));
    }

    #[test]
    fn test_memory_storage_identities_differ() {
        let a = MemoryStorage::new();
        let b = MemoryStorage::new();
        assert_ne!(a.identity(), b.identity());
    }

    #[tokio::test]
    async fn test_file_storage_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let storage = JsonFileStorage::new(dir.path().join("store.json"));
        assert!(storage.get("anything").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_storage_persists_across_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        let first = JsonFileStorage::new(&path);
        first.set("addressesInfo.maxSize", json!(5)).await.unwrap();
        first.set("text", json!("hello")).await.unwrap();

        let second = JsonFileStorage::new(&path);
        assert_eq!(second.get("addressesInfo.maxSize").await.unwrap(), Some(json!(5)));
        assert_eq!(second.get("text").await.unwrap(), Some(json!("hello")));
        assert_eq!(first.identity(), second.identity());
    }

    #[tokio::test]
    async fn test_file_storage_failed_write_keeps_cache() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("gone");
        std::fs::create_dir(&folder).unwrap();
        let storage = JsonFileStorage::new(folder.join("store.json"));
        storage.set("k", json!(1)).await.unwrap();

        std::fs::remove_dir_all(&folder).unwrap();
        assert!(storage.set("k", json!(2)).await.is_err());
        assert!(storage.set("new", json!(3)).await.is_err());

        assert_eq!(storage.get("k").await.unwrap(), Some(json!(1)));
        assert_eq!(storage.get("new").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_storage_rejects_non_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "[1,2,3]").unwrap();

        let storage = JsonFileStorage::new(&path);
        let err = storage.get("k").await.unwrap_err();
        assert!(matches!(err, MemoryError::Malformed { .. }));
    }
}

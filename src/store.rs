//! Persisted key/value configuration store.
//!
//! [`ConfigStore`] is the narrow interface the rest of the crate needs:
//! `get`/`set`/`has`/`clear` over JSON values. [`FileStore`] keeps one JSON
//! object per namespace in a file (default `~/.clawdbot/clawdbot-companion.json`)
//! and rewrites it atomically on every mutation. [`MemoryStore`] is the
//! non-persistent variant used in tests and ephemeral runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;

/// Namespace (file stem) for the companion's settings.
pub const NAMESPACE: &str = "clawdbot-companion";

/// Directory name under `$HOME`.
pub const CONFIG_DIR_NAME: &str = ".clawdbot";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config store decode error: {0}")]
    Decode(String),
    #[error("cannot determine home directory")]
    NoHome,
}

pub trait ConfigStore: Send {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        self.set_many(vec![(key.to_string(), value)])
    }

    /// Write several keys in one go (one file write for the file store).
    fn set_many(&mut self, entries: Vec<(String, Value)>) -> Result<(), StoreError>;

    fn has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Remove every key in the namespace.
    fn clear(&mut self) -> Result<(), StoreError>;

    /// True when nothing has ever been persisted (first launch).
    fn is_empty(&self) -> bool;
}

/// In-memory store; contents vanish with the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: BTreeMap<String, Value>,
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.get(key).cloned())
    }

    fn set_many(&mut self, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        self.values.extend(entries);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.values.clear();
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// JSON-file-backed store. The whole object is cached in memory and written
/// back (temp file + rename) on each mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Map<String, Value>,
    existed: bool,
}

impl FileStore {
    /// Open `<dir>/<NAMESPACE>.json`, creating nothing until the first write.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(format!("{NAMESPACE}.json"));
        let (values, existed) = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => (Map::new(), true),
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(map)) => (map, true),
                Ok(_) => {
                    return Err(StoreError::Decode(format!(
                        "{} does not contain a JSON object",
                        path.display()
                    )))
                }
                Err(e) => {
                    return Err(StoreError::Decode(format!(
                        "failed to parse {}: {e}",
                        path.display()
                    )))
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Map::new(), false),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path,
            values,
            existed,
        })
    }

    /// Open the store in the default location (`~/.clawdbot`).
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(&default_dir()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let body = serde_json::to_string_pretty(&self.values)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        self.existed = true;
        Ok(())
    }
}

impl ConfigStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.get(key).cloned())
    }

    fn set_many(&mut self, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        self.values.extend(entries);
        self.flush()
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.values.clear();
        self.flush()
    }

    fn is_empty(&self) -> bool {
        !self.existed || self.values.is_empty()
    }
}

/// `$HOME/.clawdbot`.
pub fn default_dir() -> Result<PathBuf, StoreError> {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIR_NAME))
        .ok_or(StoreError::NoHome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();
        assert!(store.is_empty());
        assert!(!store.has("apiSecret").unwrap());

        store.set("apiSecret", json!("abc")).unwrap();
        store.set("autoConnect", json!(true)).unwrap();

        let reopened = FileStore::open(dir.path()).unwrap();
        assert!(!reopened.is_empty());
        assert_eq!(reopened.get("apiSecret").unwrap(), Some(json!("abc")));
        assert_eq!(reopened.get("autoConnect").unwrap(), Some(json!(true)));
        assert!(reopened.path().ends_with("clawdbot-companion.json"));
    }

    #[test]
    fn file_store_clear_empties_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();
        store.set("theme", json!("light")).unwrap();
        store.clear().unwrap();

        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("theme").unwrap(), None);
    }

    #[test]
    fn file_store_rejects_non_object() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clawdbot-companion.json"), "[1,2]").unwrap();
        assert!(matches!(
            FileStore::open(dir.path()),
            Err(StoreError::Decode(_))
        ));
    }

    #[test]
    fn file_store_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let mut store = FileStore::open(&nested).unwrap();
        store.set("theme", json!("dark")).unwrap();
        assert!(nested.join("clawdbot-companion.json").exists());
    }

    #[test]
    fn memory_store_basics() {
        let mut store = MemoryStore::default();
        assert!(store.is_empty());
        store.set("k", json!(1)).unwrap();
        assert!(store.has("k").unwrap());
        store.clear().unwrap();
        assert!(!store.has("k").unwrap());
    }
}

//! Namespaced settings persistence.
//!
//! Every access goes through a [`Scope`]: open a namespace, read or put
//! values, then `end()` it. A read-write scope writes back on `end()` only
//! when something changed.

use crate::traits::{SettingsMap, SettingsStore};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// An open namespace.
pub struct Scope<'a> {
    store: &'a dyn SettingsStore,
    namespace: String,
    values: SettingsMap,
    writable: bool,
    dirty: bool,
}

impl<'a> Scope<'a> {
    pub fn open(store: &'a dyn SettingsStore, namespace: &str, read_only: bool) -> Result<Self> {
        let values = store.read(namespace)?;
        Ok(Self {
            store,
            namespace: namespace.to_string(),
            values,
            writable: !read_only,
            dirty: false,
        })
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values.get(key).and_then(Value::as_i64).unwrap_or(default)
    }

    pub fn put_string(&mut self, key: &str, value: &str) -> Result<()> {
        self.put(key, Value::from(value))
    }

    pub fn put_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.put(key, Value::from(value))
    }

    pub fn put_int(&mut self, key: &str, value: i64) -> Result<()> {
        self.put(key, Value::from(value))
    }

    fn put(&mut self, key: &str, value: Value) -> Result<()> {
        if !self.writable {
            return Err(Error::Settings(format!(
                "namespace '{}' was opened read-only",
                self.namespace
            )));
        }
        if self.values.get(key) != Some(&value) {
            self.values.insert(key.to_string(), value);
            self.dirty = true;
        }
        Ok(())
    }

    /// Closes the scope, persisting pending changes.
    pub fn end(self) -> Result<()> {
        if self.dirty {
            self.store.write(&self.namespace, &self.values)?;
        }
        Ok(())
    }
}

/// In-memory store. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespaces: Mutex<HashMap<String, SettingsMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn read(&self, namespace: &str) -> Result<SettingsMap> {
        let namespaces = self
            .namespaces
            .lock()
            .map_err(|_| Error::Settings("memory store poisoned".into()))?;
        Ok(namespaces.get(namespace).cloned().unwrap_or_default())
    }

    fn write(&self, namespace: &str, values: &SettingsMap) -> Result<()> {
        let mut namespaces = self
            .namespaces
            .lock()
            .map_err(|_| Error::Settings("memory store poisoned".into()))?;
        namespaces.insert(namespace.to_string(), values.clone());
        Ok(())
    }
}

/// One JSON file per namespace, e.g. `<dir>/wifi.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{}.json", namespace))
    }
}

impl SettingsStore for FileStore {
    fn read(&self, namespace: &str) -> Result<SettingsMap> {
        let path = self.path(namespace);
        if !path.exists() {
            return Ok(SettingsMap::new());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write(&self, namespace: &str, values: &SettingsMap) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(namespace);
        // 先写临时文件再重命名
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!(namespace, path = %path.display(), "Settings written");
        Ok(())
    }
}

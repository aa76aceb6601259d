//! Key-value backends.
//!
//! Every backend speaks the same flat-namespace JSON map. Writes are
//! last-write-wins with no locking across processes.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::common::error::{StorageError, StorageResult};

/// Flat map of keys to JSON values.
pub type StorageMap = serde_json::Map<String, Value>;

/// Changes observed in one write, keyed by storage key.
pub type ChangeSet = BTreeMap<String, StorageChange>;

/// A single key's transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

const CHANGE_CAPACITY: usize = 64;

/// Async key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Read the given keys. Absent keys are omitted from the result.
    async fn get(&self, keys: &[String]) -> StorageResult<StorageMap>;

    /// Write every entry of `items`.
    async fn set(&self, items: StorageMap) -> StorageResult<()>;

    /// Delete the given keys.
    async fn remove(&self, keys: &[String]) -> StorageResult<()>;

    /// Subscribe to changes, if the backend publishes them.
    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeSet>> {
        None
    }
}

/// Apply `items` to `entries`, returning the keys whose value actually changed.
fn apply_set(entries: &mut StorageMap, items: StorageMap) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for (key, value) in items {
        let old = entries.insert(key.clone(), value.clone());
        if old.as_ref() != Some(&value) {
            changes.insert(
                key,
                StorageChange {
                    old_value: old,
                    new_value: Some(value),
                },
            );
        }
    }
    changes
}

fn apply_remove(entries: &mut StorageMap, keys: &[String]) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for key in keys {
        if let Some(old) = entries.remove(key) {
            changes.insert(
                key.clone(),
                StorageChange {
                    old_value: Some(old),
                    new_value: None,
                },
            );
        }
    }
    changes
}

fn select(entries: &StorageMap, keys: &[String]) -> StorageMap {
    keys.iter()
        .filter_map(|key| entries.get(key).map(|v| (key.clone(), v.clone())))
        .collect()
}

fn publish(tx: &broadcast::Sender<ChangeSet>, changes: ChangeSet) {
    if changes.is_empty() {
        return;
    }
    // No receivers is fine.
    let _ = tx.send(changes);
}

/// In-process synchronized store.
pub struct MemoryStore {
    entries: Mutex<StorageMap>,
    changes: broadcast::Sender<ChangeSet>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            entries: Mutex::new(StorageMap::new()),
            changes,
        }
    }

    /// Snapshot of every entry.
    pub fn snapshot(&self) -> StorageMap {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, keys: &[String]) -> StorageResult<StorageMap> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(select(&entries, keys))
    }

    async fn set(&self, items: StorageMap) -> StorageResult<()> {
        let changes = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            apply_set(&mut entries, items)
        };
        publish(&self.changes, changes);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> StorageResult<()> {
        let changes = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            apply_remove(&mut entries, keys)
        };
        publish(&self.changes, changes);
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeSet>> {
        Some(self.changes.subscribe())
    }
}

/// JSON document on disk.
///
/// The file is re-read on every operation so writes from other processes
/// are observed; concurrent writers race and the last rename wins.
pub struct FileStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
    changes: broadcast::Sender<ChangeSet>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
            changes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    async fn read_all(&self) -> StorageResult<StorageMap> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StorageMap::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        match serde_json::from_slice::<StorageMap>(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(path = %self.path.display(), "Store file is corrupt, treating as empty: {}", e);
                Ok(StorageMap::new())
            }
        }
    }

    async fn write_all(&self, entries: &StorageMap) -> StorageResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let body = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), keys = entries.len(), "Store file written");
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, keys: &[String]) -> StorageResult<StorageMap> {
        let _guard = self.lock.lock().await;
        let entries = self.read_all().await?;
        Ok(select(&entries, keys))
    }

    async fn set(&self, items: StorageMap) -> StorageResult<()> {
        let changes = {
            let _guard = self.lock.lock().await;
            let mut entries = self.read_all().await?;
            let changes = apply_set(&mut entries, items);
            self.write_all(&entries).await?;
            changes
        };
        publish(&self.changes, changes);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> StorageResult<()> {
        let changes = {
            let _guard = self.lock.lock().await;
            let mut entries = self.read_all().await?;
            let changes = apply_remove(&mut entries, keys);
            if !changes.is_empty() {
                self.write_all(&entries).await?;
            }
            changes
        };
        publish(&self.changes, changes);
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeSet>> {
        Some(self.changes.subscribe())
    }
}

/// Per-origin string store used when no extension host is reachable.
///
/// Values are kept as JSON text; entries that fail to decode read as absent.
#[derive(Default)]
pub struct LocalFallbackStore {
    entries: Mutex<HashMap<String, String>>,
}

impl LocalFallbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw text under `key`, bypassing JSON encoding.
    pub fn set_raw(&self, key: &str, raw: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), raw.to_string());
    }
}

#[async_trait]
impl KeyValueStore for LocalFallbackStore {
    fn name(&self) -> &'static str {
        "local-fallback"
    }

    async fn get(&self, keys: &[String]) -> StorageResult<StorageMap> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = StorageMap::new();
        for key in keys {
            let Some(raw) = entries.get(key) else {
                continue;
            };
            match serde_json::from_str::<Value>(raw) {
                Ok(value) => {
                    out.insert(key.clone(), value);
                }
                Err(e) => debug!(key = %key, "Ignoring undecodable local entry: {}", e),
            }
        }
        Ok(out)
    }

    async fn set(&self, items: StorageMap) -> StorageResult<()> {
        let encoded = items
            .into_iter()
            .map(|(key, value)| Ok((key, serde_json::to_string(&value)?)))
            .collect::<StorageResult<Vec<_>>>()?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.extend(encoded);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> StorageResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

/// Build a one-entry map.
pub fn entry(key: &str, value: impl Into<Value>) -> StorageMap {
    let mut map = StorageMap::new();
    map.insert(key.to_string(), value.into());
    map
}

/// Owned key list from string slices.
pub fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

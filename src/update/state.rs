//! Persisted update state, shared by the router and the version checker.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::common::error::StorageResult;
use crate::storage::store::{KeyValueStore, StorageMap};

pub const KEY_USE_REMOTE: &str = "update_use_remote";
pub const KEY_REMOTE_VERSION: &str = "update_remote_version";
pub const KEY_FAIL_COUNT: &str = "update_fail_count";
pub const KEY_FAIL_TIMESTAMP: &str = "update_fail_timestamp";

const ALL_KEYS: [&str; 4] = [
    KEY_USE_REMOTE,
    KEY_REMOTE_VERSION,
    KEY_FAIL_COUNT,
    KEY_FAIL_TIMESTAMP,
];

/// Snapshot of the update keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateState {
    pub use_remote: bool,
    pub remote_version: Option<String>,
    pub fail_count: u32,
    pub fail_timestamp: Option<i64>,
}

impl UpdateState {
    fn from_map(map: &StorageMap) -> Self {
        Self {
            use_remote: map.get(KEY_USE_REMOTE).and_then(Value::as_bool).unwrap_or(false),
            remote_version: map
                .get(KEY_REMOTE_VERSION)
                .and_then(Value::as_str)
                .map(str::to_string),
            fail_count: map
                .get(KEY_FAIL_COUNT)
                .and_then(Value::as_u64)
                .map(|n| n.min(u32::MAX as u64) as u32)
                .unwrap_or(0),
            fail_timestamp: map.get(KEY_FAIL_TIMESTAMP).and_then(Value::as_i64),
        }
    }
}

fn key_list(names: &[&str]) -> Vec<String> {
    names.iter().map(|k| k.to_string()).collect()
}

/// Typed access to the update keys of a store.
#[derive(Clone)]
pub struct UpdateStateStore {
    store: Arc<dyn KeyValueStore>,
}

impl UpdateStateStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn backend(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub async fn load(&self) -> StorageResult<UpdateState> {
        let map = self.store.get(&key_list(&ALL_KEYS)).await?;
        Ok(UpdateState::from_map(&map))
    }

    /// Set the flag; clearing it removes the key.
    pub async fn set_use_remote(&self, use_remote: bool) -> StorageResult<()> {
        if use_remote {
            let mut items = StorageMap::new();
            items.insert(KEY_USE_REMOTE.to_string(), json!(true));
            self.store.set(items).await
        } else {
            self.store.remove(&key_list(&[KEY_USE_REMOTE])).await
        }
    }

    /// Record a successful precache of `version`.
    pub async fn mark_ready(&self, version: &str) -> StorageResult<()> {
        let mut items = StorageMap::new();
        items.insert(KEY_USE_REMOTE.to_string(), json!(true));
        items.insert(KEY_REMOTE_VERSION.to_string(), json!(version));
        self.store.set(items).await?;
        self.clear_failures().await
    }

    /// Write both failure fields in one call.
    pub async fn write_failures(&self, count: u32, timestamp_ms: Option<i64>) -> StorageResult<()> {
        let mut items = StorageMap::new();
        items.insert(KEY_FAIL_COUNT.to_string(), json!(count));
        items.insert(
            KEY_FAIL_TIMESTAMP.to_string(),
            timestamp_ms.map(Value::from).unwrap_or(Value::Null),
        );
        self.store.set(items).await
    }

    pub async fn clear_failures(&self) -> StorageResult<()> {
        self.store
            .remove(&key_list(&[KEY_FAIL_COUNT, KEY_FAIL_TIMESTAMP]))
            .await
    }

    /// Remove every update key.
    pub async fn reset(&self) -> StorageResult<()> {
        self.store.remove(&key_list(&ALL_KEYS)).await
    }
}

//! Reactive persisted values.
//!
//! A `PersistentState` answers reads synchronously from memory. The stored
//! value is loaded once in the background and writes go to the backend
//! fire-and-forget: a failed write is logged and the in-memory value stays.
//! Across tabs the last completed write wins. Changes the backend publishes
//! for the key (another tab, or the bridge host) replace the value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::runtime::StorageRuntime;
use super::store::{ChangeSet, StorageMap};

struct Inner<T> {
    key: String,
    value: watch::Sender<T>,
    loading: watch::Sender<bool>,
    /// Set by the first local write; a late initial load must not clobber it.
    touched: AtomicBool,
}

/// A value persisted under one key.
pub struct PersistentState<T> {
    inner: Arc<Inner<T>>,
    runtime: Arc<StorageRuntime>,
}

impl<T> Clone for PersistentState<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            runtime: Arc::clone(&self.runtime),
        }
    }
}

impl<T> PersistentState<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Start with `initial` and load the stored value in the background.
    pub fn load(runtime: Arc<StorageRuntime>, key: impl Into<String>, initial: T) -> Self {
        let (value, _) = watch::channel(initial);
        let (loading, _) = watch::channel(true);
        let state = Self {
            inner: Arc::new(Inner {
                key: key.into(),
                value,
                loading,
                touched: AtomicBool::new(false),
            }),
            runtime,
        };
        tokio::spawn(state.clone().initial_load());
        state
    }

    async fn initial_load(self) {
        let key = &self.inner.key;
        let store = self.runtime.store().await;
        // Subscribe before reading so no change slips between the two.
        let changes = store.subscribe();
        match store.get(std::slice::from_ref(key)).await {
            Ok(mut data) => {
                if let Some(raw) = data.remove(key) {
                    match serde_json::from_value::<T>(raw) {
                        Ok(stored) if !self.inner.touched.load(Ordering::SeqCst) => {
                            self.inner.value.send_replace(stored);
                        }
                        Ok(_) => debug!(key = %key, "Local write happened during load, keeping it"),
                        Err(e) => warn!(key = %key, "Ignoring undecodable stored value: {}", e),
                    }
                }
            }
            Err(e) => warn!(key = %key, backend = store.name(), "Failed to load value: {}", e),
        }
        self.inner.loading.send_replace(false);

        if let Some(rx) = changes {
            tokio::spawn(follow_changes(Arc::downgrade(&self.inner), rx));
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Current in-memory value.
    pub fn get(&self) -> T {
        self.inner.value.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        *self.inner.loading.borrow()
    }

    /// Wait until the initial load has finished.
    pub async fn loaded(&self) {
        let mut loading = self.inner.loading.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = loading.wait_for(|l| !*l).await;
    }

    /// Observe value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.inner.value.subscribe()
    }

    /// Replace the value now and persist it in the background.
    ///
    /// The returned handle may be ignored; it only exists so callers that
    /// care can wait for the backend write.
    pub fn set(&self, value: T) -> JoinHandle<()> {
        self.inner.touched.store(true, Ordering::SeqCst);
        self.inner.value.send_replace(value.clone());

        let key = self.inner.key.clone();
        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move {
            let encoded = match serde_json::to_value(&value) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(key = %key, "Failed to encode value: {}", e);
                    return;
                }
            };
            let mut items = StorageMap::new();
            items.insert(key.clone(), encoded);

            let store = runtime.store().await;
            if let Err(e) = store.set(items).await {
                warn!(key = %key, backend = store.name(), "Background write failed: {}", e);
            }
        })
    }
}

/// Apply published changes for the key until the state or the store goes away.
async fn follow_changes<T>(inner: Weak<Inner<T>>, mut rx: broadcast::Receiver<ChangeSet>)
where
    T: DeserializeOwned,
{
    loop {
        let changes = match rx.recv().await {
            Ok(changes) => changes,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Persistent state fell behind on store changes");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else { break };
        let Some(change) = changes.get(&inner.key) else {
            continue;
        };
        match &change.new_value {
            Some(raw) => match serde_json::from_value::<T>(raw.clone()) {
                Ok(value) => {
                    inner.value.send_replace(value);
                }
                Err(e) => warn!(key = %inner.key, "Ignoring undecodable change: {}", e),
            },
            None => debug!(key = %inner.key, "Key removed from store, keeping value"),
        }
    }
}

//! Process-wide storage state: the memoized strategy, the lazily created
//! bridge client and the local fallback.
//!
//! Created once per context and shut down explicitly when the context goes
//! away.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::store::{KeyValueStore, LocalFallbackStore};
use super::strategy::{StorageStrategy, StorageStrategyResolver};
use crate::bridge::channel::Endpoint;
use crate::bridge::client::StorageBridgeClient;

/// What the current execution context can reach.
pub struct HostEnvironment {
    /// The extension's synchronized store, when running with extension privileges.
    pub extension_store: Option<Arc<dyn KeyValueStore>>,
    /// Link to the parent context, when embedded.
    pub parent: Option<Endpoint>,
    /// Origin-local storage.
    pub local_store: Arc<dyn KeyValueStore>,
}

impl HostEnvironment {
    /// Running inside the extension itself.
    pub fn extension(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            extension_store: Some(store),
            parent: None,
            local_store: Arc::new(LocalFallbackStore::new()),
        }
    }

    /// Running inside a frame embedded by the extension.
    pub fn embedded(parent: Endpoint) -> Self {
        Self {
            extension_store: None,
            parent: Some(parent),
            local_store: Arc::new(LocalFallbackStore::new()),
        }
    }

    /// Plain tab with no extension host.
    pub fn standalone() -> Self {
        Self {
            extension_store: None,
            parent: None,
            local_store: Arc::new(LocalFallbackStore::new()),
        }
    }

    pub fn with_local_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.local_store = store;
        self
    }

    pub fn is_embedded(&self) -> bool {
        self.parent.is_some()
    }
}

/// Storage entry point for one execution context.
pub struct StorageRuntime {
    resolver: StorageStrategyResolver,
    extension_store: Option<Arc<dyn KeyValueStore>>,
    parent: Mutex<Option<Endpoint>>,
    bridge: OnceCell<Option<Arc<StorageBridgeClient>>>,
    local_store: Arc<dyn KeyValueStore>,
    handshake_timeout: Duration,
}

impl StorageRuntime {
    pub fn new(env: HostEnvironment, handshake_timeout: Duration) -> Self {
        Self {
            resolver: StorageStrategyResolver::new(env.extension_store.is_some(), env.is_embedded()),
            extension_store: env.extension_store,
            parent: Mutex::new(env.parent),
            bridge: OnceCell::new(),
            local_store: env.local_store,
            handshake_timeout,
        }
    }

    pub fn strategy(&self) -> StorageStrategy {
        self.resolver.resolve()
    }

    /// The backend to use right now.
    ///
    /// When bridged, the first call performs the handshake; every concurrent
    /// caller waits on that same handshake.
    pub async fn store(&self) -> Arc<dyn KeyValueStore> {
        match self.resolver.resolve() {
            StorageStrategy::DirectExtension => match &self.extension_store {
                Some(store) => Arc::clone(store),
                None => Arc::clone(&self.local_store),
            },
            StorageStrategy::LocalFallback => Arc::clone(&self.local_store),
            StorageStrategy::BridgedRemote => match self.bridge().await {
                Some(client) => client as Arc<dyn KeyValueStore>,
                None => Arc::clone(&self.local_store),
            },
        }
    }

    async fn bridge(&self) -> Option<Arc<StorageBridgeClient>> {
        self.bridge
            .get_or_init(|| async {
                let parent = self.parent.lock().unwrap_or_else(|e| e.into_inner()).take();
                let Some(parent) = parent else {
                    self.resolver.downgrade_to_local();
                    return None;
                };
                let client = Arc::new(StorageBridgeClient::connect(parent, self.handshake_timeout));
                match client.wait_for_ready().await {
                    Ok(()) => {
                        debug!("Storage bridge handshake complete");
                        Some(client)
                    }
                    Err(e) => {
                        warn!("Storage bridge handshake failed: {}", e);
                        client.close();
                        self.resolver.downgrade_to_local();
                        None
                    }
                }
            })
            .await
            .clone()
    }

    /// Tear down the bridge client, failing any in-flight requests.
    pub fn shutdown(&self) {
        if let Some(Some(client)) = self.bridge.get() {
            client.close();
        }
    }
}

impl Drop for StorageRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::{link, BrowsingContext};
    use crate::bridge::client::HANDSHAKE_TIMEOUT;
    use crate::bridge::host::StorageBridgeHost;
    use crate::storage::store::{entry, keys, MemoryStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_extension_context_uses_direct_store() {
        let direct = Arc::new(MemoryStore::new());
        let runtime = StorageRuntime::new(HostEnvironment::extension(direct), HANDSHAKE_TIMEOUT);
        assert_eq!(runtime.strategy(), StorageStrategy::DirectExtension);
        assert_eq!(runtime.store().await.name(), "memory");
    }

    #[tokio::test]
    async fn test_standalone_context_uses_local_store() {
        let runtime = StorageRuntime::new(HostEnvironment::standalone(), HANDSHAKE_TIMEOUT);
        assert_eq!(runtime.strategy(), StorageStrategy::LocalFallback);
        assert_eq!(runtime.store().await.name(), "local-fallback");
    }

    #[tokio::test]
    async fn test_embedded_context_goes_through_bridge() {
        let direct = Arc::new(MemoryStore::new());
        direct.set(entry("settings", json!({"theme": "light"}))).await.unwrap();

        let (host_side, frame_side) = link(
            BrowsingContext::new("chrome-extension://abc"),
            BrowsingContext::new("https://app.example.com"),
        );
        let _host = StorageBridgeHost::new(direct, "https://app.example.com").spawn(host_side);

        let runtime = StorageRuntime::new(HostEnvironment::embedded(frame_side), HANDSHAKE_TIMEOUT);
        let store = runtime.store().await;
        assert_eq!(store.name(), "bridge");
        assert_eq!(runtime.strategy(), StorageStrategy::BridgedRemote);

        let got = store.get(&keys(&["settings"])).await.unwrap();
        assert_eq!(got["settings"], json!({"theme": "light"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_downgrades_permanently() {
        let (_host_side, frame_side) = link(
            BrowsingContext::new("chrome-extension://abc"),
            BrowsingContext::new("https://app.example.com"),
        );
        let runtime = StorageRuntime::new(HostEnvironment::embedded(frame_side), HANDSHAKE_TIMEOUT);
        assert_eq!(runtime.strategy(), StorageStrategy::BridgedRemote);

        let store = runtime.store().await;
        assert_eq!(store.name(), "local-fallback");
        assert_eq!(runtime.strategy(), StorageStrategy::LocalFallback);

        // Stays local even if asked again.
        assert_eq!(runtime.store().await.name(), "local-fallback");
    }
}

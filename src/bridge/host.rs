//! Storage bridge host, running in the privileged context that owns the
//! direct store.
//!
//! The host answers handshake, get and set requests from one embedded frame
//! and pushes store mutations back to it. Anything not coming from the
//! expected origin is dropped without a reply.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::{Endpoint, Envelope, Outbox};
use super::messages::BridgeMessage;
use crate::storage::store::{ChangeSet, KeyValueStore, StorageMap};

/// Running host task. Stops when dropped.
pub struct HostHandle {
    task: Option<JoinHandle<()>>,
}

impl HostHandle {
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Storage bridge host stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Storage bridge host bound to one embedded frame.
pub struct StorageBridgeHost {
    store: Arc<dyn KeyValueStore>,
    expected_origin: String,
}

impl StorageBridgeHost {
    pub fn new(store: Arc<dyn KeyValueStore>, expected_origin: impl Into<String>) -> Self {
        Self {
            store,
            expected_origin: expected_origin.into(),
        }
    }

    /// Serve the frame on the other side of `endpoint` until stopped.
    pub fn spawn(self, endpoint: Endpoint) -> HostHandle {
        info!(
            frame = %endpoint.peer().id,
            origin = %self.expected_origin,
            "Starting storage bridge host"
        );
        let task = tokio::spawn(self.run(endpoint));
        HostHandle { task: Some(task) }
    }

    async fn run(self, endpoint: Endpoint) {
        let (outbox, mut inbox) = endpoint.into_parts();
        let mut changes = self.store.subscribe();

        loop {
            tokio::select! {
                envelope = inbox.recv() => {
                    let Some(envelope) = envelope else {
                        debug!("Frame inbox closed, host exiting");
                        break;
                    };
                    self.handle_envelope(&outbox, envelope).await;
                }
                change = next_change(&mut changes) => {
                    match change {
                        Some(changes) => {
                            outbox.post(&BridgeMessage::Changed { changes });
                        }
                        None => changes = None,
                    }
                }
            }
        }
    }

    async fn handle_envelope(&self, outbox: &Outbox, envelope: Envelope) {
        if envelope.origin != self.expected_origin {
            debug!(
                origin = %envelope.origin,
                expected = %self.expected_origin,
                "Dropping message from unexpected origin"
            );
            return;
        }
        let msg = match BridgeMessage::decode(&envelope.payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Dropping malformed bridge message: {}", e);
                return;
            }
        };

        let reply = match msg {
            BridgeMessage::Hello => {
                debug!(frame = %envelope.source, "Frame announced, sending ready");
                BridgeMessage::Ready
            }
            BridgeMessage::Get { id, keys } => match self.store.get(&keys).await {
                Ok(data) => BridgeMessage::GetResponse {
                    id,
                    data,
                    error: None,
                },
                Err(e) => {
                    warn!(id = %id, "Bridged get failed: {}", e);
                    BridgeMessage::GetResponse {
                        id,
                        data: StorageMap::new(),
                        error: Some(e.to_string()),
                    }
                }
            },
            BridgeMessage::Set { id, data } => match self.store.set(data).await {
                Ok(()) => BridgeMessage::SetAck { id, error: None },
                Err(e) => {
                    warn!(id = %id, "Bridged set failed: {}", e);
                    BridgeMessage::SetAck {
                        id,
                        error: Some(e.to_string()),
                    }
                }
            },
            other => {
                debug!("Host ignoring unexpected {}", other.tag());
                return;
            }
        };
        outbox.post(&reply);
    }
}

/// Next change batch, or `None` once the store stops publishing.
/// Pends forever when the store does not publish at all.
async fn next_change(rx: &mut Option<broadcast::Receiver<ChangeSet>>) -> Option<ChangeSet> {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(changes) => return Some(changes),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Host fell behind on store changes");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::{link, BrowsingContext, Inbox};
    use crate::bridge::client::{StorageBridgeClient, HANDSHAKE_TIMEOUT};
    use crate::bridge::messages::RequestId;
    use crate::storage::store::{entry, keys, MemoryStore};
    use serde_json::json;
    use std::time::Duration;

    const FRAME_ORIGIN: &str = "https://app.example.com";

    fn frame_link() -> (Endpoint, Endpoint) {
        link(
            BrowsingContext::new("chrome-extension://abc"),
            BrowsingContext::new(FRAME_ORIGIN),
        )
    }

    async fn next_message(inbox: &mut Inbox) -> BridgeMessage {
        let envelope = inbox.recv().await.unwrap();
        BridgeMessage::decode(&envelope.payload).unwrap()
    }

    #[tokio::test]
    async fn test_client_round_trip_through_host() {
        let store = Arc::new(MemoryStore::new());
        let (host_side, frame_side) = frame_link();
        let _host = StorageBridgeHost::new(store.clone(), FRAME_ORIGIN).spawn(host_side);

        let client = StorageBridgeClient::connect(frame_side, HANDSHAKE_TIMEOUT);
        client.wait_for_ready().await.unwrap();

        client.set(entry("settings", json!({"clock": "24h"}))).await.unwrap();
        assert_eq!(store.snapshot()["settings"], json!({"clock": "24h"}));

        let got = client.get(keys(&["settings", "missing"])).await.unwrap();
        assert_eq!(got["settings"], json!({"clock": "24h"}));
        assert!(!got.contains_key("missing"));
    }

    #[tokio::test]
    async fn test_host_pushes_external_changes() {
        let store = Arc::new(MemoryStore::new());
        let (host_side, frame_side) = frame_link();
        let _host = StorageBridgeHost::new(store.clone(), FRAME_ORIGIN).spawn(host_side);

        let client = StorageBridgeClient::connect(frame_side, HANDSHAKE_TIMEOUT);
        client.wait_for_ready().await.unwrap();
        let mut rx = KeyValueStore::subscribe(&client).unwrap();

        // Another tab writes directly to the privileged store.
        store.set(entry("timezones", json!(["Europe/Paris"]))).await.unwrap();

        let changes = rx.recv().await.unwrap();
        assert_eq!(changes["timezones"].new_value, Some(json!(["Europe/Paris"])));
    }

    #[tokio::test]
    async fn test_host_drops_wrong_origin() {
        let store = Arc::new(MemoryStore::new());
        let (host_side, frame_side) = link(
            BrowsingContext::new("chrome-extension://abc"),
            BrowsingContext::new("https://evil.example.net"),
        );
        let _host = StorageBridgeHost::new(store.clone(), FRAME_ORIGIN).spawn(host_side);
        let (outbox, mut inbox) = frame_side.into_parts();

        outbox.post(&BridgeMessage::Hello);
        outbox.post(&BridgeMessage::Set {
            id: RequestId("x-1".to_string()),
            data: entry("settings", 1),
        });

        let reply = tokio::time::timeout(Duration::from_millis(50), inbox.recv()).await;
        assert!(reply.is_err(), "host must not answer a foreign origin");
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_host_echoes_correlation_id() {
        let store = Arc::new(MemoryStore::new());
        store.set(entry("a", 1)).await.unwrap();
        let (host_side, frame_side) = frame_link();
        let _host = StorageBridgeHost::new(store, FRAME_ORIGIN).spawn(host_side);
        let (outbox, mut inbox) = frame_side.into_parts();

        outbox.post(&BridgeMessage::Get {
            id: RequestId("req-42".to_string()),
            keys: keys(&["a"]),
        });
        match next_message(&mut inbox).await {
            BridgeMessage::GetResponse { id, data, error } => {
                assert_eq!(id, RequestId("req-42".to_string()));
                assert_eq!(data["a"], json!(1));
                assert!(error.is_none());
            }
            other => panic!("expected get response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_ends_host() {
        let (host_side, _frame_side) = frame_link();
        let mut host = StorageBridgeHost::new(Arc::new(MemoryStore::new()), FRAME_ORIGIN)
            .spawn(host_side);
        assert!(host.is_running());
        host.stop();
        assert!(!host.is_running());
    }
}

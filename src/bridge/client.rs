//! Storage bridge client, running inside the embedded context.
//!
//! On construction the client announces itself to its parent and starts a
//! reader task. Requests are matched to responses through the
//! `PendingRequestTable`; only the initial handshake is bounded by a timeout.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::{ContextId, Endpoint, Inbox, Outbox};
use super::messages::{BridgeMessage, RequestId};
use crate::common::error::{BridgeError, BridgeResult, StorageError, StorageResult};
use crate::storage::store::{ChangeSet, KeyValueStore, StorageMap};

/// Default wait for the host's ready acknowledgment.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// Handle returned by `on_changed`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ChangeListener = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

/// Outstanding requests keyed by correlation id.
///
/// Entries leave the table only when their response arrives or when the
/// client is torn down.
#[derive(Default)]
pub struct PendingRequestTable {
    entries: HashMap<RequestId, oneshot::Sender<BridgeMessage>>,
}

impl PendingRequestTable {
    pub fn insert(&mut self, id: RequestId, tx: oneshot::Sender<BridgeMessage>) {
        self.entries.insert(id, tx);
    }

    pub fn take(&mut self, id: &RequestId) -> Option<oneshot::Sender<BridgeMessage>> {
        self.entries.remove(id)
    }

    /// Remove every entry; their callers observe `BridgeError::Closed`.
    pub fn drain(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct ClientShared {
    pending: Mutex<PendingRequestTable>,
    listeners: Mutex<Vec<(ListenerId, ChangeListener)>>,
    changes: broadcast::Sender<ChangeSet>,
    closed: AtomicBool,
}

impl ClientShared {
    fn pending(&self) -> std::sync::MutexGuard<'_, PendingRequestTable> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, changes: &ChangeSet) {
        let listeners: Vec<ChangeListener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(changes))).is_err() {
                warn!("Storage change listener panicked, continuing with the rest");
            }
        }
        let _ = self.changes.send(changes.clone());
    }
}

/// Client half of the storage bridge.
pub struct StorageBridgeClient {
    outbox: Outbox,
    shared: Arc<ClientShared>,
    ready_rx: watch::Receiver<bool>,
    nonce: u32,
    next_seq: AtomicU64,
    next_listener: AtomicU64,
    handshake_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StorageBridgeClient {
    /// Announce presence to the parent and start listening.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(endpoint: Endpoint, handshake_timeout: Duration) -> Self {
        let (outbox, inbox) = endpoint.into_parts();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (changes, _) = broadcast::channel(64);
        let shared = Arc::new(ClientShared {
            pending: Mutex::new(PendingRequestTable::default()),
            listeners: Mutex::new(Vec::new()),
            changes,
            closed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(run_reader(
            inbox,
            outbox.peer().id,
            Arc::clone(&shared),
            ready_tx,
        ));

        debug!(parent = %outbox.peer().id, "Announcing storage bridge client");
        outbox.post(&BridgeMessage::Hello);

        Self {
            outbox,
            shared,
            ready_rx,
            nonce: rand::random(),
            next_seq: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
            handshake_timeout,
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Resolve once the host has acknowledged us.
    ///
    /// An error means "no bridge available"; callers fall back to local storage.
    pub async fn wait_for_ready(&self) -> BridgeResult<()> {
        let mut ready = self.ready_rx.clone();
        let waited = tokio::time::timeout(self.handshake_timeout, ready.wait_for(|r| *r))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BridgeError::Closed),
            Err(_) => Err(BridgeError::HandshakeTimeout {
                timeout_ms: self.handshake_timeout.as_millis() as u64,
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Read keys through the host. No timeout is applied.
    pub async fn get(&self, keys: Vec<String>) -> BridgeResult<StorageMap> {
        let id = self.next_id();
        let response = self
            .request(id.clone(), BridgeMessage::Get { id: id.clone(), keys })
            .await?;
        match response {
            BridgeMessage::GetResponse { error: Some(message), .. } => {
                Err(BridgeError::Remote { message })
            }
            BridgeMessage::GetResponse { data, .. } => Ok(data),
            _ => Err(BridgeError::UnexpectedResponse { id: id.0 }),
        }
    }

    /// Write entries through the host. No timeout is applied.
    pub async fn set(&self, data: StorageMap) -> BridgeResult<()> {
        let id = self.next_id();
        let response = self
            .request(id.clone(), BridgeMessage::Set { id: id.clone(), data })
            .await?;
        match response {
            BridgeMessage::SetAck { error: Some(message), .. } => {
                Err(BridgeError::Remote { message })
            }
            BridgeMessage::SetAck { .. } => Ok(()),
            _ => Err(BridgeError::UnexpectedResponse { id: id.0 }),
        }
    }

    /// Register a listener for changes pushed by the host.
    pub fn on_changed(&self, listener: impl Fn(&ChangeSet) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }

    /// Stop the reader and fail every pending request.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reader) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reader.abort();
        }
        let dropped = self.shared.pending().drain();
        info!(dropped, "Storage bridge client closed");
    }

    fn next_id(&self) -> RequestId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        RequestId(format!("{:08x}-{}", self.nonce, seq))
    }

    async fn request(&self, id: RequestId, msg: BridgeMessage) -> BridgeResult<BridgeMessage> {
        if self.outbox.is_peer_gone() {
            debug!(id = %id, "Parent gone, closing bridge client");
            self.close();
            return Err(BridgeError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        {
            // Checked under the table lock so close() cannot slip in between.
            let mut pending = self.shared.pending();
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(BridgeError::Closed);
            }
            pending.insert(id, tx);
        }

        // Entries leave the table only on response or teardown, so an
        // undeliverable request tears the client down.
        if !self.outbox.post(&msg) {
            self.close();
        }

        rx.await.map_err(|_| BridgeError::Closed)
    }
}

impl Drop for StorageBridgeClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_reader(
    mut inbox: Inbox,
    parent: ContextId,
    shared: Arc<ClientShared>,
    ready_tx: watch::Sender<bool>,
) {
    while let Some(envelope) = inbox.recv().await {
        if envelope.source != parent {
            debug!(source = %envelope.source, "Dropping message not sent by parent");
            continue;
        }
        let msg = match BridgeMessage::decode(&envelope.payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Dropping malformed bridge message: {}", e);
                continue;
            }
        };

        match msg {
            BridgeMessage::Ready => {
                debug!("Storage bridge host is ready");
                ready_tx.send_replace(true);
            }
            BridgeMessage::GetResponse { .. } | BridgeMessage::SetAck { .. } => {
                let Some(id) = msg.request_id().cloned() else {
                    continue;
                };
                let waiter = shared.pending().take(&id);
                match waiter {
                    Some(tx) => {
                        // Receiver gone means the caller stopped waiting.
                        let _ = tx.send(msg);
                    }
                    None => debug!(id = %id, "Dropping response for unknown request"),
                }
            }
            BridgeMessage::Changed { changes } => shared.notify(&changes),
            other => debug!("Client ignoring unexpected {}", other.tag()),
        }
    }
    debug!("Storage bridge client reader ended");
}

#[async_trait]
impl KeyValueStore for StorageBridgeClient {
    fn name(&self) -> &'static str {
        "bridge"
    }

    async fn get(&self, keys: &[String]) -> StorageResult<StorageMap> {
        Ok(StorageBridgeClient::get(self, keys.to_vec()).await?)
    }

    async fn set(&self, items: StorageMap) -> StorageResult<()> {
        Ok(StorageBridgeClient::set(self, items).await?)
    }

    async fn remove(&self, _keys: &[String]) -> StorageResult<()> {
        Err(StorageError::Unsupported {
            backend: "bridge",
            operation: "remove",
        })
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeSet>> {
        Some(self.shared.changes.subscribe())
    }
}

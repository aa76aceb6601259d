//! Message passing between browsing contexts.
//!
//! A context can post to any other context whose `Mailbox` it holds; the
//! receiver sees the sender's id and origin on every `Envelope` and decides
//! for itself whether to trust it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::messages::BridgeMessage;

/// Identity of a browsing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

impl ContextId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// A browsing context: who it is and which origin its document runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowsingContext {
    pub id: ContextId,
    pub origin: String,
}

impl BrowsingContext {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            id: ContextId::next(),
            origin: origin.into(),
        }
    }
}

/// A posted message as seen by the receiver.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub source: ContextId,
    pub origin: String,
    pub payload: String,
}

impl Envelope {
    /// Wrap `msg` as if posted by `from`.
    pub fn from_message(from: &BrowsingContext, msg: &BridgeMessage) -> Option<Self> {
        match msg.encode() {
            Ok(payload) => Some(Self {
                source: from.id,
                origin: from.origin.clone(),
                payload,
            }),
            Err(e) => {
                warn!("Failed to encode {}: {}", msg.tag(), e);
                None
            }
        }
    }
}

/// Address of a context's inbox.
#[derive(Debug, Clone)]
pub struct Mailbox {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Mailbox {
    /// Deliver an envelope. Returns false if the context is gone.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Sending half bound to one peer.
#[derive(Debug, Clone)]
pub struct Outbox {
    local: BrowsingContext,
    peer: BrowsingContext,
    peer_mailbox: Mailbox,
}

impl Outbox {
    pub fn local(&self) -> &BrowsingContext {
        &self.local
    }

    pub fn peer(&self) -> &BrowsingContext {
        &self.peer
    }

    /// Whether the peer's inbox has been dropped.
    pub fn is_peer_gone(&self) -> bool {
        self.peer_mailbox.is_closed()
    }

    /// Post `msg` to the peer. Returns false if it could not be delivered.
    pub fn post(&self, msg: &BridgeMessage) -> bool {
        let Some(envelope) = Envelope::from_message(&self.local, msg) else {
            return false;
        };
        let delivered = self.peer_mailbox.deliver(envelope);
        if !delivered {
            debug!(peer = %self.peer.id, "Peer gone, dropped {}", msg.tag());
        }
        delivered
    }
}

/// Receiving half.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

/// One side of a parent/child link.
#[derive(Debug)]
pub struct Endpoint {
    outbox: Outbox,
    own_mailbox: Mailbox,
    inbox: Inbox,
}

impl Endpoint {
    pub fn local(&self) -> &BrowsingContext {
        self.outbox.local()
    }

    pub fn peer(&self) -> &BrowsingContext {
        self.outbox.peer()
    }

    pub fn post(&self, msg: &BridgeMessage) -> bool {
        self.outbox.post(msg)
    }

    /// This context's own inbox address, for third parties to post to.
    pub fn mailbox(&self) -> Mailbox {
        self.own_mailbox.clone()
    }

    pub fn into_parts(self) -> (Outbox, Inbox) {
        (self.outbox, self.inbox)
    }
}

/// Link a parent context with a child embedded in it.
///
/// Returns `(parent_side, child_side)`.
pub fn link(parent: BrowsingContext, child: BrowsingContext) -> (Endpoint, Endpoint) {
    let (parent_tx, parent_rx) = mpsc::unbounded_channel();
    let (child_tx, child_rx) = mpsc::unbounded_channel();
    let parent_mailbox = Mailbox { tx: parent_tx };
    let child_mailbox = Mailbox { tx: child_tx };

    let parent_side = Endpoint {
        outbox: Outbox {
            local: parent.clone(),
            peer: child.clone(),
            peer_mailbox: child_mailbox.clone(),
        },
        own_mailbox: parent_mailbox.clone(),
        inbox: Inbox { rx: parent_rx },
    };
    let child_side = Endpoint {
        outbox: Outbox {
            local: child,
            peer: parent,
            peer_mailbox: parent_mailbox,
        },
        own_mailbox: child_mailbox,
        inbox: Inbox { rx: child_rx },
    };
    (parent_side, child_side)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_delivers_with_sender_identity() {
        let parent = BrowsingContext::new("chrome-extension://abc");
        let child = BrowsingContext::new("https://app.example.com");
        let (parent_side, child_side) = link(parent.clone(), child.clone());

        assert!(child_side.post(&BridgeMessage::Hello));

        let (_, mut inbox) = parent_side.into_parts();
        let envelope = inbox.recv().await.unwrap();
        assert_eq!(envelope.source, child.id);
        assert_eq!(envelope.origin, child.origin);
        assert_eq!(BridgeMessage::decode(&envelope.payload).unwrap(), BridgeMessage::Hello);
    }

    #[tokio::test]
    async fn test_post_to_dropped_peer_reports_failure() {
        let (parent_side, child_side) = link(
            BrowsingContext::new("chrome-extension://abc"),
            BrowsingContext::new("https://app.example.com"),
        );
        let (outbox, _inbox) = child_side.into_parts();
        assert!(!outbox.is_peer_gone());
        drop(parent_side);
        assert!(outbox.is_peer_gone());
        assert!(!outbox.post(&BridgeMessage::Hello));
    }

    #[test]
    fn test_context_ids_are_unique() {
        assert_ne!(ContextId::next(), ContextId::next());
    }
}

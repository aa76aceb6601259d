//! Storage bridge between an embedded frame and its privileged parent.
//!
//! ## Module Structure
//!
//! - `channel`: browsing contexts, envelopes and parent/child links
//! - `messages`: the tagged wire protocol
//! - `client`: embedded side (`StorageBridgeClient`)
//! - `host`: privileged side (`StorageBridgeHost`)

pub mod channel;
pub mod client;
pub mod host;
pub mod messages;

pub use channel::{link, BrowsingContext, ContextId, Endpoint, Envelope, Mailbox};
pub use client::{ListenerId, PendingRequestTable, StorageBridgeClient, HANDSHAKE_TIMEOUT};
pub use host::{HostHandle, StorageBridgeHost};
pub use messages::{BridgeMessage, RequestId, MESSAGE_NAMESPACE};

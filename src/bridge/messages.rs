//! Wire messages exchanged between the storage bridge client and host.
//!
//! Every message is a JSON object tagged with a namespaced `type` string.
//! Request/response pairs carry the caller's correlation id.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::store::{ChangeSet, StorageMap};

/// Namespace prefix of every message tag.
pub const MESSAGE_NAMESPACE: &str = "tabshell-storage";

/// Correlation id linking a request to its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage bridge protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeMessage {
    /// Client announces itself to its parent.
    #[serde(rename = "tabshell-storage:hello")]
    Hello,

    /// Host acknowledges the client.
    #[serde(rename = "tabshell-storage:ready")]
    Ready,

    #[serde(rename = "tabshell-storage:get")]
    Get { id: RequestId, keys: Vec<String> },

    #[serde(rename = "tabshell-storage:get-response")]
    GetResponse {
        id: RequestId,
        data: StorageMap,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "tabshell-storage:set")]
    Set { id: RequestId, data: StorageMap },

    #[serde(rename = "tabshell-storage:set-ack")]
    SetAck {
        id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Unsolicited push of store mutations observed by the host.
    #[serde(rename = "tabshell-storage:changed")]
    Changed { changes: ChangeSet },
}

impl BridgeMessage {
    /// Stable tag, as written on the wire.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Hello => "tabshell-storage:hello",
            Self::Ready => "tabshell-storage:ready",
            Self::Get { .. } => "tabshell-storage:get",
            Self::GetResponse { .. } => "tabshell-storage:get-response",
            Self::Set { .. } => "tabshell-storage:set",
            Self::SetAck { .. } => "tabshell-storage:set-ack",
            Self::Changed { .. } => "tabshell-storage:changed",
        }
    }

    /// Correlation id, for request and response variants.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Get { id, .. }
            | Self::GetResponse { id, .. }
            | Self::Set { id, .. }
            | Self::SetAck { id, .. } => Some(id),
            Self::Hello | Self::Ready | Self::Changed { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

// Network module for peer-to-peer communication
//
// Wire protocol between cluster members: one tagged JSON message per request,
// answered by one response. Transports implement `NetworkClient`; inbound messages
// are dispatched to a `PeerMessageHandler`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StorageNodeError};
use crate::storage::sync_queue::SyncOperation;
use crate::storage::vector_clock::VectorClock;
use crate::types::{Atom, NodeId, NodeStatus, PeerInfo};

pub mod http;
pub mod in_process;

pub use http::HttpNetworkClient;
pub use in_process::InProcessNetwork;

/// Recognized peer commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerCommand {
    Register,
    Discover,
    Heartbeat,
    Goodbye,
    ReplicateAtom,
    FetchAtom,
    RemoveAtom,
    FetchAllAtoms,
}

/// Message exchanged between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    pub command: PeerCommand,
    pub sender_id: NodeId,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl PeerMessage {
    pub fn new<T: Serialize>(command: PeerCommand, sender_id: impl Into<NodeId>, payload: &T) -> Result<Self> {
        Ok(Self {
            command,
            sender_id: sender_id.into(),
            payload: serde_json::to_value(payload)?,
            timestamp: Utc::now(),
        })
    }

    /// Decode a message from raw bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| StorageNodeError::MalformedMessage(e.to_string()))
    }

    /// Decode the payload as the command's typed body
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            StorageNodeError::MalformedMessage(format!("{:?} payload: {}", self.command, e))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Found,
    NotFound,
    Error,
}

/// Answer to a [`PeerMessage`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerResponse {
    pub status: ResponseStatus,
    pub sender_id: NodeId,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PeerResponse {
    pub fn with_status<T: Serialize>(status: ResponseStatus, sender_id: impl Into<NodeId>, payload: &T) -> Self {
        Self {
            status,
            sender_id: sender_id.into(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            error: None,
        }
    }

    pub fn ok<T: Serialize>(sender_id: impl Into<NodeId>, payload: &T) -> Self {
        Self::with_status(ResponseStatus::Ok, sender_id, payload)
    }

    pub fn ack(sender_id: impl Into<NodeId>) -> Self {
        Self::with_status(ResponseStatus::Ok, sender_id, &Value::Null)
    }

    pub fn error(sender_id: impl Into<NodeId>, message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            sender_id: sender_id.into(),
            payload: Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status != ResponseStatus::Error
    }

    /// Turn an error response into a network error naming the peer
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(StorageNodeError::Network(format!(
                "peer {} answered with error: {}",
                self.sender_id,
                self.error.as_deref().unwrap_or("unknown")
            )))
        }
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| StorageNodeError::MalformedMessage(format!("response from {}: {}", self.sender_id, e)))
    }
}

/// Peer metadata exchanged on registration and discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIntroduction {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub cluster_id: String,
}

impl From<&PeerInfo> for PeerIntroduction {
    fn from(info: &PeerInfo) -> Self {
        Self {
            id: info.id.clone(),
            host: info.host.clone(),
            port: info.port,
            display_name: info.display_name.clone(),
            cluster_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub peers: Vec<PeerIntroduction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub node_id: NodeId,
    pub status: NodeStatus,
    /// Sender address, so unknown senders can be registered
    #[serde(default)]
    pub introduction: Option<PeerIntroduction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodbyePayload {
    pub node_id: NodeId,
}

/// Body of `replicate_atom` and `remove_atom`.
///
/// The atom data travels as `operation.payload` and the origin as
/// `operation.source_node`; a removal sends the handle as `operation.key` with
/// no payload. The version fields ride along so receivers can order mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPayload {
    pub operation: SyncOperation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResponse {
    /// Whether the receiving node now holds the atom locally
    pub stored: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchAtomPayload {
    pub handle: String,
    pub requesting_node: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchAllPayload {
    pub requesting_node: NodeId,
}

/// Atom with the version metadata a peer needs for reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomRecord {
    pub atom: Atom,
    #[serde(default)]
    pub vector_clock: VectorClock,
    pub timestamp: DateTime<Utc>,
    pub source_node: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchAtomResponse {
    pub atom_data: Option<AtomRecord>,
    /// Owner of the key as the responding node last saw it
    #[serde(default)]
    pub owner: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryResponse {
    pub atoms: Vec<AtomRecord>,
}

/// Outbound transport to peers
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Deliver `message` to `peer` and wait for its answer
    async fn send(&self, peer: &PeerInfo, message: PeerMessage) -> Result<PeerResponse>;
}

/// Inbound side of the protocol
#[async_trait]
pub trait PeerMessageHandler: Send + Sync {
    async fn handle(&self, message: PeerMessage) -> PeerResponse;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sync_queue::OperationKind;
    use serde_json::json;

    #[test]
    fn test_message_wire_format() {
        let message = PeerMessage::new(
            PeerCommand::FetchAtom,
            "n1",
            &FetchAtomPayload {
                handle: "ConceptNode:x".into(),
                requesting_node: "n1".into(),
            },
        )
        .unwrap();

        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["command"], json!("fetch_atom"));
        assert_eq!(wire["sender_id"], json!("n1"));
        assert_eq!(wire["payload"]["handle"], json!("ConceptNode:x"));

        let parsed = PeerMessage::parse(&serde_json::to_vec(&message).unwrap()).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_operation_payload_carries_atom_and_source() {
        let atom = Atom::concept("x").with_truth_value(0.6, 0.2);
        let add = OperationPayload {
            operation: SyncOperation::new(
                OperationKind::Add,
                atom.handle.clone(),
                Some(atom.clone()),
                "n1",
                VectorClock::new(),
            ),
        };
        let wire = serde_json::to_value(&add).unwrap();
        assert_eq!(wire["operation"]["payload"]["handle"], json!("ConceptNode:x"));
        assert_eq!(wire["operation"]["source_node"], json!("n1"));

        let remove = OperationPayload {
            operation: SyncOperation::new(OperationKind::Remove, "ConceptNode:x", None, "n2", VectorClock::new()),
        };
        let wire = serde_json::to_value(&remove).unwrap();
        assert_eq!(wire["operation"]["key"], json!("ConceptNode:x"));
        assert_eq!(wire["operation"]["source_node"], json!("n2"));
        assert!(wire["operation"]["payload"].is_null());
    }

    #[test]
    fn test_malformed_input_is_typed() {
        assert!(matches!(
            PeerMessage::parse(b"{not json"),
            Err(StorageNodeError::MalformedMessage(_))
        ));
        assert!(matches!(
            PeerMessage::parse(br#"{"command":"explode","sender_id":"x","timestamp":"2024-01-01T00:00:00Z"}"#),
            Err(StorageNodeError::MalformedMessage(_))
        ));

        let message = PeerMessage::new(PeerCommand::FetchAtom, "n1", &json!({"wrong": 1})).unwrap();
        assert!(matches!(
            message.decode_payload::<FetchAtomPayload>(),
            Err(StorageNodeError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_error_response_becomes_network_error() {
        let response = PeerResponse::error("n2", "disk on fire");
        assert!(!response.is_success());
        assert!(matches!(response.into_result(), Err(StorageNodeError::Network(_))));

        let found = PeerResponse::with_status(ResponseStatus::NotFound, "n2", &Value::Null);
        assert!(found.into_result().is_ok());
    }
}

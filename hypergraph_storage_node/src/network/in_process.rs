// In-process transport
//
// Routes messages between nodes living in the same process by address. Each
// message still goes through the JSON wire format. Addresses can be marked
// unreachable to simulate a partitioned peer.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Weak};

use super::{NetworkClient, PeerMessage, PeerMessageHandler, PeerResponse};
use crate::error::{Result, StorageNodeError};
use crate::types::PeerInfo;

#[derive(Default)]
pub struct InProcessNetwork {
    handlers: DashMap<String, Weak<dyn PeerMessageHandler>>,
    unreachable: DashSet<String>,
}

impl InProcessNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route messages for `address` ("host:port") to `handler`
    pub fn register(&self, address: impl Into<String>, handler: Arc<dyn PeerMessageHandler>) {
        self.handlers.insert(address.into(), Arc::downgrade(&handler));
    }

    pub fn unregister(&self, address: &str) {
        self.handlers.remove(address);
    }

    /// Make `address` drop (`false`) or accept (`true`) traffic
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if reachable {
            self.unreachable.remove(address);
        } else {
            self.unreachable.insert(address.to_string());
        }
    }
}

#[async_trait]
impl NetworkClient for InProcessNetwork {
    async fn send(&self, peer: &PeerInfo, message: PeerMessage) -> Result<PeerResponse> {
        let address = peer.address();
        if self.unreachable.contains(&address) {
            return Err(StorageNodeError::Network(format!("{} is unreachable", address)));
        }

        let handler = self
            .handlers
            .get(&address)
            .and_then(|entry| entry.value().upgrade())
            .ok_or_else(|| StorageNodeError::Network(format!("no node listening on {}", address)))?;

        let inbound = PeerMessage::parse(&serde_json::to_vec(&message)?)?;
        let response = handler.handle(inbound).await;
        let wire = serde_json::to_vec(&response)?;
        serde_json::from_slice(&wire).map_err(|e| StorageNodeError::MalformedMessage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::PeerCommand;
    use serde_json::Value;

    struct Echo;

    #[async_trait]
    impl PeerMessageHandler for Echo {
        async fn handle(&self, message: PeerMessage) -> PeerResponse {
            PeerResponse::ok("echo", &message.payload)
        }
    }

    #[tokio::test]
    async fn test_routing_and_reachability() {
        let network = InProcessNetwork::new();
        let echo: Arc<dyn PeerMessageHandler> = Arc::new(Echo);
        network.register("127.0.0.1:1", echo.clone());

        let peer = PeerInfo::new("echo", "127.0.0.1", 1);
        let message = PeerMessage::new(PeerCommand::Discover, "n1", &"hello").unwrap();
        let response = network.send(&peer, message.clone()).await.unwrap();
        assert_eq!(response.payload, Value::String("hello".into()));

        network.set_reachable("127.0.0.1:1", false);
        assert!(network.send(&peer, message.clone()).await.unwrap_err().is_network());

        network.set_reachable("127.0.0.1:1", true);
        drop(echo);
        // Only a weak reference is kept
        assert!(network.send(&peer, message).await.is_err());
    }
}

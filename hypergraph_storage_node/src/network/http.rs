// HTTP transport for the peer protocol
//
// Messages are POSTed as JSON to `http://host:port/cluster/message`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use super::{NetworkClient, PeerMessage, PeerResponse};
use crate::error::{Result, StorageNodeError};
use crate::types::PeerInfo;

/// Path every node serves the peer protocol on
pub const MESSAGE_PATH: &str = "/cluster/message";

/// HTTP-based network client implementation
#[derive(Debug, Clone)]
pub struct HttpNetworkClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpNetworkClient {
    /// Create a new HTTP network client
    pub fn new(timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();

        Self {
            client,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn url_for(peer: &PeerInfo) -> String {
        format!("http://{}{}", peer.address(), MESSAGE_PATH)
    }
}

#[async_trait]
impl NetworkClient for HttpNetworkClient {
    async fn send(&self, peer: &PeerInfo, message: PeerMessage) -> Result<PeerResponse> {
        let url = Self::url_for(peer);
        debug!("Sending {:?} to {} at {}", message.command, peer.id, url);

        let response = timeout(self.timeout, self.client.post(&url).json(&message).send())
            .await
            .map_err(|_| StorageNodeError::Timeout)??;

        let status = response.status();
        let body = timeout(self.timeout, response.bytes())
            .await
            .map_err(|_| StorageNodeError::Timeout)??;

        // Error statuses still carry a PeerResponse when the peer produced one
        match serde_json::from_slice::<PeerResponse>(&body) {
            Ok(peer_response) => Ok(peer_response),
            Err(_) if !status.is_success() => Err(StorageNodeError::Network(format!(
                "Request to {} failed: HTTP {}",
                peer.id, status
            ))),
            Err(e) => Err(StorageNodeError::MalformedMessage(format!(
                "Unreadable response from {}: {}",
                peer.id, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{PeerCommand, PeerMessage};
    use serde_json::Value;

    #[test]
    fn test_url_for_peer() {
        let peer = PeerInfo::new("n1", "10.0.0.5", 7420);
        assert_eq!(HttpNetworkClient::url_for(&peer), "http://10.0.0.5:7420/cluster/message");
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_network_error() {
        let client = HttpNetworkClient::new(200);
        // Port 9 (discard) on localhost is closed in test environments
        let peer = PeerInfo::new("ghost", "127.0.0.1", 9);
        let message = PeerMessage::new(PeerCommand::Discover, "n1", &Value::Null).unwrap();
        let err = client.send(&peer, message).await.unwrap_err();
        assert!(err.is_network(), "unexpected error: {:?}", err);
    }
}

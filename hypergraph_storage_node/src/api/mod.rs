// HTTP API for the storage node
//
// Serves the peer protocol on `/cluster/message` plus a liveness check and a
// stats endpoint. Peer message bodies are parsed here rather than by an axum
// extractor so malformed input can be counted and dropped.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::network::http::MESSAGE_PATH;
use crate::network::{PeerMessage, PeerMessageHandler};
use crate::storage::DistributedStorageNode;
use crate::types::{NodeId, NodeStatus};

#[derive(Debug, Serialize)]
struct HealthResponse {
    node_id: NodeId,
    cluster_id: String,
    status: NodeStatus,
    peers: usize,
}

/// Router for `node`, with request tracing
pub fn router(node: Arc<DistributedStorageNode>) -> Router {
    Router::new()
        .route(MESSAGE_PATH, post(peer_message_handler))
        .route("/health", get(health_handler))
        .route("/cluster/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

async fn peer_message_handler(
    State(node): State<Arc<DistributedStorageNode>>,
    body: Bytes,
) -> axum::response::Response {
    let message = match PeerMessage::parse(&body) {
        Ok(message) => message,
        Err(e) => {
            warn!("Rejected malformed peer message ({} bytes): {}", body.len(), e);
            node.record_malformed_message();
            return e.into_response();
        }
    };

    debug!("Received {:?} from {}", message.command, message.sender_id);
    let response = node.handle(message).await;
    (StatusCode::OK, Json(response)).into_response()
}

async fn health_handler(State(node): State<Arc<DistributedStorageNode>>) -> impl IntoResponse {
    let membership = node.membership();
    let status = membership.status();
    let code = match status {
        NodeStatus::Active | NodeStatus::Initializing => StatusCode::OK,
        NodeStatus::Offline | NodeStatus::Failed => StatusCode::SERVICE_UNAVAILABLE,
    };
    let health = HealthResponse {
        node_id: node.node_id().clone(),
        cluster_id: node.config().cluster_id.clone(),
        status,
        peers: membership.peer_count(),
    };
    (code, Json(health))
}

async fn stats_handler(State(node): State<Arc<DistributedStorageNode>>) -> impl IntoResponse {
    Json(node.cluster_stats().await.to_map())
}

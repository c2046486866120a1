// Hypergraph Storage Node
//
// A clustered storage layer for a knowledge hypergraph. Atoms (nodes and links
// carrying a truth value) are partitioned across cluster members, replicated
// to backup holders, and kept convergent through per-key vector clocks and a
// configurable conflict resolver.
//
// # Architecture
//
// * **Cluster**: membership, heartbeats, stale-peer eviction and lifecycle events
// * **Storage**: local knowledge stores (memory, sqlite), partition planning,
//   the sync queue, conflict resolution and the distributed node itself
// * **Network**: the JSON peer protocol over HTTP or an in-process transport
// * **API**: the axum router serving the peer protocol
//
// # Usage
//
// ```rust,no_run
// use hypergraph_storage_node::config::ClusterConfig;
// use hypergraph_storage_node::network::HttpNetworkClient;
// use hypergraph_storage_node::storage::{DistributedStorageNode, MemoryKnowledgeStore};
// use hypergraph_storage_node::types::Atom;
// use std::sync::Arc;
//
// async fn example() -> hypergraph_storage_node::error::Result<()> {
//     let config = ClusterConfig::default();
//     let network = Arc::new(HttpNetworkClient::new(config.peer_timeout_ms));
//     let node = DistributedStorageNode::new(config, Arc::new(MemoryKnowledgeStore::default()), network)?;
//     node.start().await?;
//     node.store(Atom::concept("cat").with_truth_value(0.9, 0.5)).await;
//     node.stop().await;
//     Ok(())
// }
// ```

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod network;
pub mod storage;
pub mod types;

pub use error::{Result, StorageNodeError};

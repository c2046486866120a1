// Distributed storage node
//
// Orchestrates placement, local persistence, replica pushes, the sync queue and
// conflict resolution on top of a pluggable local knowledge store. Remote
// failures are logged and counted; only local store failures change the result
// of a public operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::conflict::{ConflictInfo, ConflictResolver, Resolution, VersionedAtom};
use super::key_locks::KeyLocks;
use super::partition::{KeyMigration, PartitionAssignment, PartitionConfig, PartitionPlanner, RebalancePlan};
use super::sync_queue::{OperationKind, SyncOperation, SyncQueue};
use super::vector_clock::{VectorClock, VectorClockRelation};
use super::LocalKnowledgeStore;
use crate::cluster::{ClusterEvent, ClusterEventListener, ClusterMembership, MembershipConfig, MembershipStats};
use crate::config::ClusterConfig;
use crate::error::{Result, StorageNodeError};
use crate::network::{
    ApplyResponse, AtomRecord, FetchAllPayload, FetchAtomPayload, FetchAtomResponse, InventoryResponse,
    NetworkClient, OperationPayload, PeerCommand, PeerMessage, PeerMessageHandler, PeerResponse, ResponseStatus,
};
use crate::types::{Atom, AtomSpace, NodeId, NodeStatus, PartitionStrategy, PeerInfo, ReplicationStrategy, SyncStrategy};

/// Version metadata kept per key
#[derive(Debug, Clone, PartialEq)]
struct KeyVersion {
    vector_clock: VectorClock,
    timestamp: DateTime<Utc>,
    source_node: NodeId,
    /// Tombstone marker; keeps stale adds from resurrecting removed keys
    deleted: bool,
}

/// What applying a remote operation did
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The operation was newer and was applied as sent
    Applied,
    /// The operation was stale or a duplicate
    Ignored,
    /// The operation was concurrent with the local version
    Resolved(Resolution),
}

#[derive(Debug, Default)]
struct NodeCounters {
    replications_sent: AtomicU64,
    failed_replications: AtomicU64,
    conflicts_detected: AtomicU64,
    sync_rounds: AtomicU64,
    operations_delivered: AtomicU64,
    expired_operations: AtomicU64,
    remote_fetch_hits: AtomicU64,
    malformed_messages: AtomicU64,
    local_failures: AtomicU64,
}

/// Node-level counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub replications_sent: u64,
    pub failed_replications: u64,
    pub conflicts_detected: u64,
    pub sync_rounds: u64,
    pub operations_delivered: u64,
    pub expired_operations: u64,
    pub remote_fetch_hits: u64,
    pub malformed_messages: u64,
    pub local_failures: u64,
}

/// Cluster-wide view from this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub cluster_id: String,
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub known_peers: usize,
    pub active_peers: usize,
    pub local_atomspace_size: usize,
    pub pending_sync_operations: usize,
    pub vector_clock: VectorClock,
    pub sync_strategy: SyncStrategy,
    pub partition_strategy: PartitionStrategy,
    pub replication_strategy: ReplicationStrategy,
    pub replication_factor: usize,
    pub node: NodeStats,
    pub membership: MembershipStats,
}

impl ClusterStats {
    /// Stats as a flat name → value map
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }
}

/// Key distribution over the current membership
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionMetrics {
    pub node_key_counts: BTreeMap<NodeId, usize>,
    pub total_keys: usize,
    pub ideal_load: f64,
    pub std_dev: f64,
    /// `1 / (1 + std_dev / ideal_load)`, 1.0 when there are no keys
    pub balance_score: f64,
}

impl DistributionMetrics {
    fn from_counts(node_key_counts: BTreeMap<NodeId, usize>) -> Self {
        let total_keys: usize = node_key_counts.values().sum();
        let nodes = node_key_counts.len().max(1) as f64;
        let ideal_load = total_keys as f64 / nodes;
        let variance = node_key_counts
            .values()
            .map(|&count| (count as f64 - ideal_load).powi(2))
            .sum::<f64>()
            / nodes;
        let std_dev = variance.sqrt();
        let balance_score = if total_keys == 0 {
            1.0
        } else {
            1.0 / (1.0 + std_dev / ideal_load)
        };
        Self {
            node_key_counts,
            total_keys,
            ideal_load,
            std_dev,
            balance_score,
        }
    }
}

pub struct DistributedStorageNode {
    node_id: NodeId,
    config: ClusterConfig,
    local: Arc<dyn LocalKnowledgeStore>,
    membership: Arc<ClusterMembership>,
    planner: PartitionPlanner,
    resolver: ConflictResolver,
    sync_queue: SyncQueue,
    clock: RwLock<VectorClock>,
    versions: RwLock<HashMap<String, KeyVersion>>,
    key_locks: KeyLocks,
    counters: NodeCounters,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

/// Reassigns a departed peer's keys
struct DepartureListener {
    node: Weak<DistributedStorageNode>,
}

impl ClusterEventListener for DepartureListener {
    fn on_event(&self, event: &ClusterEvent, node_id: &NodeId) {
        if *event != ClusterEvent::NodeLeft {
            return;
        }
        if let Some(node) = self.node.upgrade() {
            node.on_node_departure(node_id);
        }
    }
}

impl DistributedStorageNode {
    /// Build a node over `local`, talking to peers through `network`
    pub fn new(
        mut config: ClusterConfig,
        local: Arc<dyn LocalKnowledgeStore>,
        network: Arc<dyn NetworkClient>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let node_id = config.resolved_node_id();

        let mut info = PeerInfo::new(node_id.clone(), config.host.clone(), config.port);
        if let Some(name) = &config.display_name {
            info.display_name = name.clone();
        }
        let membership = Arc::new(ClusterMembership::new(info, MembershipConfig::from(&config), network));
        let (shutdown, _) = watch::channel(false);

        let node = Arc::new(Self {
            planner: PartitionPlanner::new(PartitionConfig::from(&config)),
            resolver: ConflictResolver::new(config.sync_strategy),
            node_id,
            config,
            local,
            membership,
            sync_queue: SyncQueue::new(),
            clock: RwLock::new(VectorClock::new()),
            versions: RwLock::new(HashMap::new()),
            key_locks: KeyLocks::new(),
            counters: NodeCounters::default(),
            running: AtomicBool::new(false),
            shutdown,
            sync_task: Mutex::new(None),
        });

        node.membership.add_event_listener(Arc::new(DepartureListener {
            node: Arc::downgrade(&node),
        }));
        Ok(node)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    pub fn planner(&self) -> &PartitionPlanner {
        &self.planner
    }

    pub fn local_store(&self) -> &Arc<dyn LocalKnowledgeStore> {
        &self.local
    }

    pub fn vector_clock(&self) -> VectorClock {
        self.clock.read().clone()
    }

    pub fn pending_sync_operations(&self) -> usize {
        self.sync_queue.len()
    }

    /// Register an observer of cluster events
    pub fn add_event_listener(&self, listener: Arc<dyn ClusterEventListener>) {
        self.membership.add_event_listener(listener);
    }

    /// Join the cluster and start the background sync loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.membership.start().await?;
        self.shutdown.send_replace(false);

        let node = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        *self.sync_task.lock() = Some(tokio::spawn(node.sync_loop(shutdown)));
        info!("Storage node {} started", self.node_id);
        Ok(())
    }

    /// Leave the cluster and stop the sync loop
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.membership.stop().await;
        self.shutdown.send_replace(true);

        let task = self.sync_task.lock().take();
        if let Some(mut task) = task {
            if timeout(self.config.sync_interval(), &mut task).await.is_err() {
                task.abort();
            }
        }
        info!("Storage node {} stopped", self.node_id);
    }

    async fn sync_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    self.trigger_sync().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Sync loop stopped");
    }

    /// Bump the node clock and the key's version for a local mutation
    fn record_local_mutation(&self, key: &str, deleted: bool) -> KeyVersion {
        self.clock.write().increment(&self.node_id);

        let mut versions = self.versions.write();
        let version = versions.entry(key.to_string()).or_insert_with(|| KeyVersion {
            vector_clock: VectorClock::new(),
            timestamp: Utc::now(),
            source_node: self.node_id.clone(),
            deleted,
        });
        version.vector_clock.increment(&self.node_id);
        version.timestamp = Utc::now();
        version.source_node = self.node_id.clone();
        version.deleted = deleted;
        version.clone()
    }

    fn record_for(&self, atom: Atom) -> AtomRecord {
        let version = self.versions.read().get(&atom.handle).cloned();
        match version {
            Some(version) => AtomRecord {
                atom,
                vector_clock: version.vector_clock,
                timestamp: version.timestamp,
                source_node: version.source_node,
            },
            None => AtomRecord {
                atom,
                vector_clock: VectorClock::new(),
                timestamp: Utc::now(),
                source_node: self.node_id.clone(),
            },
        }
    }

    /// Store `atom` in the cluster.
    ///
    /// Returns false only if the local store fails.
    pub async fn store(&self, atom: Atom) -> bool {
        let key = atom.handle.clone();
        let members = self.membership.member_ids();
        let guard = self.key_locks.lock(&key).await;
        let previous = self.planner.lookup(&key);
        let Some(placement) = self.planner.place(&key, &members) else {
            error!("No owner could be assigned for {}", key);
            return false;
        };

        if placement.is_holder(&self.node_id) {
            if let Err(e) = self.local.store(atom.clone()).await {
                warn!("Local store of {} failed: {}", key, e);
                self.counters.local_failures.fetch_add(1, Ordering::Relaxed);
                match previous {
                    Some(previous) => self.planner.record(&key, &previous),
                    None => {
                        self.planner.forget(&key);
                    }
                }
                return false;
            }
        }

        let version = self.record_local_mutation(&key, false);
        // Released before talking to peers, which take their own key locks
        drop(guard);
        let operation = SyncOperation::new(
            OperationKind::Add,
            key.clone(),
            Some(atom),
            self.node_id.clone(),
            version.vector_clock,
        )
        .with_timestamp(version.timestamp)
        .with_placement(placement.clone());

        if placement.owner == self.node_id {
            self.push_to_replicas(&operation, &placement.replicas, PeerCommand::ReplicateAtom)
                .await;
        }

        self.sync_queue.push(operation);
        debug!("Stored {} (owner {}, {} replicas)", key, placement.owner, placement.replicas.len());
        true
    }

    /// Remove `atom` from the cluster.
    ///
    /// Returns false only if the local store fails.
    pub async fn remove(&self, atom: &Atom) -> bool {
        let key = atom.handle.as_str();
        let members = self.membership.member_ids();
        let guard = self.key_locks.lock(key).await;
        let placement = self.planner.lookup(key).or_else(|| {
            self.planner.assign_owner(key, &members).map(|owner| {
                let replicas = self.planner.assign_replicas(key, &owner, &members);
                PartitionAssignment::new(owner, replicas)
            })
        });

        if let Err(e) = self.local.remove(key).await {
            warn!("Local removal of {} failed: {}", key, e);
            self.counters.local_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let version = self.record_local_mutation(key, true);
        drop(guard);
        let mut operation = SyncOperation::new(
            OperationKind::Remove,
            key,
            None,
            self.node_id.clone(),
            version.vector_clock,
        )
        .with_timestamp(version.timestamp);

        if let Some(placement) = placement {
            if placement.owner == self.node_id {
                self.push_to_replicas(&operation, &placement.replicas, PeerCommand::RemoveAtom)
                    .await;
            }
            operation = operation.with_placement(placement);
        }

        self.planner.forget(key);
        self.sync_queue.push(operation);
        true
    }

    /// Send `operation` to each replica concurrently; returns successful sends
    async fn push_to_replicas(&self, operation: &SyncOperation, replicas: &[NodeId], command: PeerCommand) -> usize {
        let mut sends = Vec::new();
        for replica in replicas {
            let Some(peer) = self.membership.peer(replica) else {
                warn!("Replica {} for {} is not a known peer", replica, operation.key);
                self.counters.failed_replications.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let payload = OperationPayload {
                operation: operation.clone().with_target(replica.clone()),
            };
            match PeerMessage::new(command, self.node_id.clone(), &payload) {
                Ok(message) => sends.push(async move { self.membership.send_to(&peer, message).await }),
                Err(e) => warn!("Failed to encode replication of {}: {}", operation.key, e),
            }
        }

        let results = join_all(sends).await;
        let delivered = results.iter().filter(|r| r.is_ok()).count();
        self.counters
            .replications_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.counters
            .failed_replications
            .fetch_add((results.len() - delivered) as u64, Ordering::Relaxed);
        delivered
    }

    /// Look up `handle`: local store first, then the last known owner, then every peer.
    pub async fn fetch(&self, handle: &str) -> Option<Atom> {
        match self.local.fetch(handle).await {
            Ok(Some(atom)) => return Some(atom),
            Ok(None) => {}
            Err(e) => warn!("Local fetch of {} failed: {}", handle, e),
        }

        let known_owner = self
            .planner
            .lookup(handle)
            .map(|assignment| assignment.owner)
            .filter(|owner| *owner != self.node_id);

        if let Some(owner) = &known_owner {
            if let Some(peer) = self.membership.peer(owner) {
                if let Some(response) = self.fetch_from(&peer, handle).await {
                    self.counters.remote_fetch_hits.fetch_add(1, Ordering::Relaxed);
                    return response.atom_data.map(|record| record.atom);
                }
            }
        }

        self.broadcast_fetch(handle, known_owner.as_deref()).await
    }

    /// Ask one peer for `handle`; `None` on miss or failure
    async fn fetch_from(&self, peer: &PeerInfo, handle: &str) -> Option<FetchAtomResponse> {
        let payload = FetchAtomPayload {
            handle: handle.to_string(),
            requesting_node: self.node_id.clone(),
        };
        let message = PeerMessage::new(PeerCommand::FetchAtom, self.node_id.clone(), &payload).ok()?;
        let response = self.membership.send_to(peer, message).await.ok()?;
        if response.status != ResponseStatus::Found {
            return None;
        }
        match response.decode_payload::<FetchAtomResponse>() {
            Ok(found) if found.atom_data.is_some() => Some(found),
            Ok(_) => None,
            Err(e) => {
                warn!("Bad fetch response from {}: {}", peer.id, e);
                None
            }
        }
    }

    /// Query up to `max_broadcast_fetch_peers` peers at once; first hit wins.
    async fn broadcast_fetch(&self, handle: &str, skip: Option<&str>) -> Option<Atom> {
        let peers: Vec<PeerInfo> = self
            .membership
            .peers()
            .into_iter()
            .filter(|peer| Some(peer.id.as_str()) != skip)
            .take(self.config.max_broadcast_fetch_peers)
            .collect();
        if peers.is_empty() {
            return None;
        }

        let mut pending: FuturesUnordered<_> = peers
            .iter()
            .map(|peer| async move { (peer.id.clone(), self.fetch_from(peer, handle).await) })
            .collect();

        let search = async {
            while let Some((peer_id, found)) = pending.next().await {
                if let Some(found) = found {
                    return Some((peer_id, found));
                }
            }
            None
        };

        match timeout(self.config.fetch_broadcast_timeout(), search).await {
            Ok(Some((peer_id, found))) => {
                self.counters.remote_fetch_hits.fetch_add(1, Ordering::Relaxed);
                let owner = found.owner.clone().unwrap_or(peer_id);
                self.planner.record_owner(handle, &owner);
                found.atom_data.map(|record| record.atom)
            }
            Ok(None) => None,
            Err(_) => {
                warn!("Broadcast fetch of {} timed out", handle);
                None
            }
        }
    }

    /// Whether this node should persist `key` under `operation`'s placement
    fn holds(&self, operation: &SyncOperation) -> bool {
        match &operation.placement {
            Some(placement) => placement.is_holder(&self.node_id),
            None => {
                let members = self.membership.member_ids();
                match self.planner.assign_owner(&operation.key, &members) {
                    Some(owner) => {
                        owner == self.node_id
                            || self
                                .planner
                                .assign_replicas(&operation.key, &owner, &members)
                                .contains(&self.node_id)
                    }
                    None => true,
                }
            }
        }
    }

    /// Keep `atom` if this node holds `key`; otherwise drop any copy left behind
    async fn write_value(&self, key: &str, atom: &Atom, holder: bool) -> Result<()> {
        if holder {
            self.local.store(atom.clone()).await
        } else {
            if self.local.remove(key).await? {
                debug!("Dropped local copy of {}, no longer a holder", key);
            }
            Ok(())
        }
    }

    /// Write the effect of `kind` on the local store
    async fn write_local(&self, key: &str, kind: OperationKind, atom: Option<&Atom>, holder: bool) -> Result<()> {
        match kind {
            OperationKind::Add | OperationKind::Update => {
                let atom = atom.ok_or_else(|| {
                    StorageNodeError::MalformedMessage(format!("{:?} of {} carries no atom", kind, key))
                })?;
                self.write_value(key, atom, holder).await?;
            }
            OperationKind::Remove => {
                self.local.remove(key).await?;
                self.planner.forget(key);
            }
        }
        Ok(())
    }

    /// Apply an operation received from a peer.
    ///
    /// Applying the same operation again is a no-op.
    pub async fn apply_remote_operation(&self, operation: SyncOperation) -> Result<ApplyOutcome> {
        let _guard = self.key_locks.lock(&operation.key).await;
        self.clock.write().merge(&operation.vector_clock);

        if let Some(placement) = &operation.placement {
            if operation.kind != OperationKind::Remove {
                self.planner.record(&operation.key, placement);
            }
        }
        let holder = self.holds(&operation);
        let key = operation.key.clone();
        let local_version = self.versions.read().get(&key).cloned();

        let Some(local_version) = local_version else {
            self.write_local(&key, operation.kind, operation.payload.as_ref(), holder).await?;
            self.adopt_version(&operation, None);
            return Ok(ApplyOutcome::Applied);
        };

        match local_version.vector_clock.compare(&operation.vector_clock) {
            VectorClockRelation::Before => {
                self.write_local(&key, operation.kind, operation.payload.as_ref(), holder).await?;
                self.adopt_version(&operation, Some(&local_version));
                Ok(ApplyOutcome::Applied)
            }
            VectorClockRelation::After | VectorClockRelation::Equal => {
                self.repair_missing_copy(&operation, &local_version, holder).await?;
                Ok(ApplyOutcome::Ignored)
            }
            VectorClockRelation::Concurrent => {
                let resolution = self.resolve_conflict(&operation, &local_version, holder).await?;
                Ok(ApplyOutcome::Resolved(resolution))
            }
        }
    }

    /// A holder that lacks the data of a version it already knows takes the payload
    async fn repair_missing_copy(&self, operation: &SyncOperation, local: &KeyVersion, holder: bool) -> Result<()> {
        let Some(atom) = &operation.payload else {
            return Ok(());
        };
        if !holder || local.deleted || operation.kind == OperationKind::Remove {
            return Ok(());
        }
        if self.local.fetch(&operation.key).await?.is_none() {
            debug!("Repairing missing copy of {}", operation.key);
            self.local.store(atom.clone()).await?;
        }
        Ok(())
    }

    fn adopt_version(&self, operation: &SyncOperation, previous: Option<&KeyVersion>) {
        let vector_clock = match previous {
            Some(previous) => previous.vector_clock.merged(&operation.vector_clock),
            None => operation.vector_clock.clone(),
        };
        self.versions.write().insert(
            operation.key.clone(),
            KeyVersion {
                vector_clock,
                timestamp: operation.timestamp,
                source_node: operation.source_node.clone(),
                deleted: operation.kind == OperationKind::Remove,
            },
        );
    }

    async fn resolve_conflict(&self, operation: &SyncOperation, local: &KeyVersion, holder: bool) -> Result<Resolution> {
        let key = operation.key.as_str();
        let local_atom = if local.deleted {
            None
        } else {
            self.local.fetch(key).await?
        };
        let local_value = VersionedAtom {
            atom: local_atom,
            vector_clock: local.vector_clock.clone(),
            timestamp: local.timestamp,
            source_node: local.source_node.clone(),
        };

        let conflict = ConflictInfo::concurrent(operation.clone(), &local.vector_clock);
        let resolution = self.resolver.resolve(&conflict, &local_value, self.local.as_ref());
        let resolution = match resolution {
            Resolution::ApplyIncoming
                if operation.kind != OperationKind::Remove && operation.payload.is_none() =>
            {
                let e = StorageNodeError::ConflictUnresolved(format!(
                    "{:?} of {} from {} won without an atom",
                    operation.kind, key, operation.source_node
                ));
                error!("{}; keeping the local value", e);
                Resolution::KeepLocal
            }
            other => other,
        };
        info!(
            "Conflict on {} with {} resolved by {:?}: {:?}",
            key,
            operation.source_node,
            self.resolver.strategy(),
            match &resolution {
                Resolution::KeepLocal => "keep local",
                Resolution::ApplyIncoming => "apply incoming",
                Resolution::Merged(_) => "merged",
            }
        );
        self.counters.conflicts_detected.fetch_add(1, Ordering::Relaxed);

        let merged_clock = local.vector_clock.merged(&operation.vector_clock);
        let mut version = local.clone();
        version.vector_clock = merged_clock;

        match &resolution {
            Resolution::KeepLocal => {}
            Resolution::ApplyIncoming => {
                self.write_local(key, operation.kind, operation.payload.as_ref(), holder).await?;
                version.timestamp = operation.timestamp;
                version.source_node = operation.source_node.clone();
                version.deleted = operation.kind == OperationKind::Remove;
            }
            Resolution::Merged(atom) => {
                self.write_value(key, atom, holder).await?;
                if operation.timestamp > version.timestamp {
                    version.timestamp = operation.timestamp;
                    version.source_node = operation.source_node.clone();
                }
                version.deleted = false;
            }
        }
        self.versions.write().insert(key.to_string(), version);

        self.membership.emit(
            ClusterEvent::ConflictDetected { key: key.to_string() },
            &operation.source_node,
        );
        Ok(resolution)
    }

    /// Flush the sync queue now; returns the number of operations fully delivered.
    pub async fn trigger_sync(&self) -> usize {
        self.prune_tombstones_at(Utc::now());
        let expired = self.sync_queue.purge_expired(self.config.sync_operation_ttl());
        if expired > 0 {
            warn!("Dropped {} sync operations past their time to live", expired);
            self.counters
                .expired_operations
                .fetch_add(expired as u64, Ordering::Relaxed);
        }

        let operations = self.sync_queue.drain();
        if operations.is_empty() {
            return 0;
        }

        let peers = self.membership.peers();
        let mut delivered = 0;
        let mut undelivered = Vec::new();

        for operation in operations {
            let targets: Vec<PeerInfo> = match &operation.target_node {
                Some(target) => match self.membership.peer(target) {
                    Some(peer) => vec![peer],
                    None => {
                        undelivered.push(operation);
                        continue;
                    }
                },
                None => peers.clone(),
            };

            let command = match operation.kind {
                OperationKind::Remove => PeerCommand::RemoveAtom,
                OperationKind::Add | OperationKind::Update => PeerCommand::ReplicateAtom,
            };
            let payload = OperationPayload {
                operation: operation.clone(),
            };
            let message = match PeerMessage::new(command, self.node_id.clone(), &payload) {
                Ok(message) => message,
                Err(e) => {
                    error!("Dropping unencodable sync operation {}: {}", operation.id, e);
                    continue;
                }
            };

            let results = join_all(targets.iter().map(|peer| self.membership.send_to(peer, message.clone()))).await;
            let failures = results.iter().filter(|r| r.is_err()).count();
            if failures == 0 {
                delivered += 1;
            } else {
                self.counters
                    .failed_replications
                    .fetch_add(failures as u64, Ordering::Relaxed);
                undelivered.push(operation);
            }
        }

        if !undelivered.is_empty() {
            debug!("{} sync operations will be retried", undelivered.len());
        }
        self.sync_queue.requeue(undelivered);
        self.counters.sync_rounds.fetch_add(1, Ordering::Relaxed);
        self.counters
            .operations_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.membership
            .emit(ClusterEvent::SyncCompleted { operations: delivered }, &self.node_id);
        delivered
    }

    /// Forget removal markers older than the sync operation TTL.
    ///
    /// Queued operations expire after the same TTL, so no stale add that
    /// predates a pruned removal can still be delivered.
    pub fn prune_tombstones_at(&self, now: DateTime<Utc>) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(self.config.sync_operation_ttl()) else {
            return 0;
        };
        let mut versions = self.versions.write();
        let before = versions.len();
        versions.retain(|_, version| !(version.deleted && now.signed_duration_since(version.timestamp) > ttl));
        let pruned = before - versions.len();
        if pruned > 0 {
            debug!("Pruned {} tombstones", pruned);
        }
        pruned
    }

    /// Keys with version metadata on this node, tombstones included
    pub fn tracked_keys(&self) -> usize {
        self.versions.read().len()
    }

    /// Every peer's inventory, paired with the peer id
    async fn collect_inventories(&self) -> Vec<(NodeId, Vec<AtomRecord>)> {
        let payload = FetchAllPayload {
            requesting_node: self.node_id.clone(),
        };
        let message = match PeerMessage::new(PeerCommand::FetchAllAtoms, self.node_id.clone(), &payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to encode inventory request: {}", e);
                return Vec::new();
            }
        };

        let mut inventories = Vec::new();
        for (peer, result) in self.membership.broadcast_with_responses(message).await {
            let Ok(response) = result else {
                continue;
            };
            match response.decode_payload::<InventoryResponse>() {
                Ok(inventory) => inventories.push((peer.id, inventory.atoms)),
                Err(e) => warn!("Bad inventory from {}: {}", peer.id, e),
            }
        }
        inventories
    }

    /// Flush the queue, then reconcile against every peer's full inventory.
    ///
    /// Returns the number of keys that changed locally.
    pub async fn full_cluster_sync(&self) -> usize {
        self.trigger_sync().await;

        let mut changed = 0;
        for (peer_id, records) in self.collect_inventories().await {
            for record in records {
                let key = record.atom.handle.clone();
                let operation = SyncOperation::new(
                    OperationKind::Update,
                    key.clone(),
                    Some(record.atom),
                    record.source_node,
                    record.vector_clock,
                )
                .with_timestamp(record.timestamp);

                match self.apply_remote_operation(operation).await {
                    Ok(ApplyOutcome::Ignored) => {}
                    Ok(_) => changed += 1,
                    Err(e) => warn!("Reconciling {} from {} failed: {}", key, peer_id, e),
                }
            }
        }
        info!("Full cluster sync changed {} keys", changed);
        changed
    }

    /// Store every atom of `space`; false if any local store failed
    pub async fn store_all(&self, space: &AtomSpace) -> bool {
        let mut ok = true;
        for atom in space.iter() {
            ok &= self.store(atom.clone()).await;
        }
        ok
    }

    /// Load the local store into `space`, then add what peers hold.
    ///
    /// Keys present on both sides with different values go through conflict resolution.
    pub async fn load_all(&self, space: &mut AtomSpace) -> bool {
        if let Err(e) = self.local.load_all(space).await {
            warn!("Loading the local store failed: {}", e);
            self.counters.local_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        for (_, records) in self.collect_inventories().await {
            for record in records {
                let Some(existing) = space.get(&record.atom.handle).cloned() else {
                    space.insert(record.atom);
                    continue;
                };
                if existing == record.atom {
                    continue;
                }

                let local = self.record_for(existing);
                let operation = SyncOperation::new(
                    OperationKind::Update,
                    record.atom.handle.clone(),
                    Some(record.atom.clone()),
                    record.source_node.clone(),
                    record.vector_clock.clone(),
                )
                .with_timestamp(record.timestamp);
                let local_value = VersionedAtom {
                    atom: Some(local.atom),
                    vector_clock: local.vector_clock,
                    timestamp: local.timestamp,
                    source_node: local.source_node,
                };
                let conflict = ConflictInfo::concurrent(operation, &local_value.vector_clock);
                match self.resolver.resolve(&conflict, &local_value, self.local.as_ref()) {
                    Resolution::KeepLocal => {}
                    Resolution::ApplyIncoming => {
                        space.insert(record.atom);
                    }
                    Resolution::Merged(atom) => {
                        space.insert(atom);
                    }
                }
            }
        }
        true
    }

    /// Even out key ownership across the cluster and move the affected keys.
    pub async fn rebalance(&self) -> Result<RebalancePlan> {
        let members = self.membership.member_ids();
        let guard = self.planner.begin_rebalance()?;
        let plan = guard.plan(&members);

        for migration in &plan.migrations {
            if let Err(e) = self.transfer_key(migration).await {
                warn!(
                    "Moving {} from {} to {} failed: {}",
                    migration.key, migration.from, migration.to, e
                );
            }
        }
        drop(guard);

        self.membership.emit(
            ClusterEvent::PartitionRebalanced {
                moved: plan.migrations.len(),
            },
            &self.node_id,
        );
        Ok(plan)
    }

    /// Current value of `key` from this node or from `source`
    async fn value_for_transfer(&self, key: &str, source: &str) -> Result<Option<Atom>> {
        if let Some(atom) = self.local.fetch(key).await? {
            return Ok(Some(atom));
        }
        let Some(peer) = self.membership.peer(source) else {
            return Ok(None);
        };
        Ok(self
            .fetch_from(&peer, key)
            .await
            .and_then(|found| found.atom_data)
            .map(|record| record.atom))
    }

    async fn transfer_key(&self, migration: &KeyMigration) -> Result<()> {
        let Some(atom) = self.value_for_transfer(&migration.key, &migration.from).await? else {
            debug!("No copy of {} reachable for transfer", migration.key);
            return Ok(());
        };

        if migration.to == self.node_id {
            let _guard = self.key_locks.lock(&migration.key).await;
            self.local.store(atom).await?;
            return Ok(());
        }

        let Some(peer) = self.membership.peer(&migration.to) else {
            return Err(StorageNodeError::Network(format!("{} is not a known peer", migration.to)));
        };
        let record = self.record_for(atom);
        let mut operation = SyncOperation::new(
            OperationKind::Update,
            migration.key.clone(),
            Some(record.atom),
            record.source_node,
            record.vector_clock,
        )
        .with_timestamp(record.timestamp)
        .with_target(migration.to.clone());
        let placement = self.planner.lookup(&migration.key);
        if let Some(placement) = &placement {
            operation = operation.with_placement(placement.clone());
        }

        let message = PeerMessage::new(
            PeerCommand::ReplicateAtom,
            self.node_id.clone(),
            &OperationPayload { operation },
        )?;
        self.membership.send_to(&peer, message).await?;

        // The donor's copy would otherwise go stale: non-holders receive no updates
        let still_holder = placement.map_or(true, |p| p.is_holder(&self.node_id));
        if migration.from == self.node_id && !still_holder {
            let _guard = self.key_locks.lock(&migration.key).await;
            if self.local.remove(&migration.key).await? {
                debug!("Handed {} to {} and dropped the local copy", migration.key, migration.to);
            }
        }
        Ok(())
    }

    /// Reassign the keys of a departed peer and recover those now owned here
    fn on_node_departure(self: &Arc<Self>, departed: &NodeId) {
        let members = self.membership.member_ids();
        let migrations = self.planner.on_node_departure(departed, &members);
        let recover: Vec<String> = migrations
            .into_iter()
            .filter(|m| m.to == self.node_id)
            .map(|m| m.key)
            .collect();
        if recover.is_empty() {
            return;
        }

        info!("Recovering {} keys owned by departed {}", recover.len(), departed);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let node = Arc::clone(self);
                handle.spawn(async move { node.recover_keys(recover).await });
            }
            Err(_) => warn!("No runtime available to recover keys of {}", departed),
        }
    }

    /// Pull keys missing from the local store from whichever peer still has them
    async fn recover_keys(&self, keys: Vec<String>) -> usize {
        let mut recovered = 0;
        for key in keys {
            match self.local.fetch(&key).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    warn!("Local lookup of {} failed: {}", key, e);
                    continue;
                }
            }
            if let Some(atom) = self.broadcast_fetch(&key, None).await {
                // The broadcast cached whoever answered; this node is the owner now
                self.planner.record_owner(&key, &self.node_id);
                let _guard = self.key_locks.lock(&key).await;
                match self.local.store(atom).await {
                    Ok(()) => recovered += 1,
                    Err(e) => warn!("Storing recovered {} failed: {}", key, e),
                }
            }
        }
        recovered
    }

    /// Count an inbound message that could not be parsed
    pub fn record_malformed_message(&self) {
        self.counters.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Per-node owned-key counts and balance score over the current membership
    pub fn distribution_metrics(&self) -> DistributionMetrics {
        let members = self.membership.member_ids();
        DistributionMetrics::from_counts(self.planner.owned_counts(&members))
    }

    pub fn get_stats(&self) -> NodeStats {
        NodeStats {
            replications_sent: self.counters.replications_sent.load(Ordering::Relaxed),
            failed_replications: self.counters.failed_replications.load(Ordering::Relaxed),
            conflicts_detected: self.counters.conflicts_detected.load(Ordering::Relaxed),
            sync_rounds: self.counters.sync_rounds.load(Ordering::Relaxed),
            operations_delivered: self.counters.operations_delivered.load(Ordering::Relaxed),
            expired_operations: self.counters.expired_operations.load(Ordering::Relaxed),
            remote_fetch_hits: self.counters.remote_fetch_hits.load(Ordering::Relaxed),
            malformed_messages: self.counters.malformed_messages.load(Ordering::Relaxed),
            local_failures: self.counters.local_failures.load(Ordering::Relaxed),
        }
    }

    pub async fn cluster_stats(&self) -> ClusterStats {
        let local_atomspace_size = match self.local.size().await {
            Ok(size) => size,
            Err(e) => {
                warn!("Could not size the local store: {}", e);
                0
            }
        };
        let membership = self.membership.stats();
        ClusterStats {
            cluster_id: self.config.cluster_id.clone(),
            node_id: self.node_id.clone(),
            status: self.membership.status(),
            known_peers: membership.known_peers,
            active_peers: membership.active_peers,
            local_atomspace_size,
            pending_sync_operations: self.sync_queue.len(),
            vector_clock: self.vector_clock(),
            sync_strategy: self.config.sync_strategy,
            partition_strategy: self.config.partition_strategy,
            replication_strategy: self.config.replication_strategy,
            replication_factor: self.config.replication_factor,
            node: self.get_stats(),
            membership,
        }
    }

    /// The local node followed by every known peer
    pub fn cluster_nodes(&self) -> Vec<PeerInfo> {
        self.membership.cluster_nodes()
    }

    async fn handle_data_message(&self, message: PeerMessage) -> Result<PeerResponse> {
        match message.command {
            PeerCommand::ReplicateAtom | PeerCommand::RemoveAtom => {
                let payload: OperationPayload = message.decode_payload()?;
                let removal = payload.operation.kind == OperationKind::Remove;
                let holder = self.holds(&payload.operation);
                self.apply_remote_operation(payload.operation).await?;
                Ok(PeerResponse::ok(
                    self.node_id.clone(),
                    &ApplyResponse {
                        stored: holder && !removal,
                    },
                ))
            }
            PeerCommand::FetchAtom => {
                let payload: FetchAtomPayload = message.decode_payload()?;
                match self.local.fetch(&payload.handle).await? {
                    Some(atom) => {
                        let response = FetchAtomResponse {
                            atom_data: Some(self.record_for(atom)),
                            owner: self.planner.lookup(&payload.handle).map(|a| a.owner),
                        };
                        Ok(PeerResponse::with_status(ResponseStatus::Found, self.node_id.clone(), &response))
                    }
                    None => Ok(PeerResponse::with_status(
                        ResponseStatus::NotFound,
                        self.node_id.clone(),
                        &FetchAtomResponse {
                            atom_data: None,
                            owner: None,
                        },
                    )),
                }
            }
            PeerCommand::FetchAllAtoms => {
                let _payload: FetchAllPayload = message.decode_payload()?;
                let atoms = self
                    .local
                    .all_atoms()
                    .await?
                    .into_iter()
                    .map(|atom| self.record_for(atom))
                    .collect();
                Ok(PeerResponse::ok(self.node_id.clone(), &InventoryResponse { atoms }))
            }
            other => Err(StorageNodeError::MalformedMessage(format!(
                "{:?} is not a data command",
                other
            ))),
        }
    }
}

#[async_trait]
impl PeerMessageHandler for DistributedStorageNode {
    async fn handle(&self, message: PeerMessage) -> PeerResponse {
        if let Some(response) = self.membership.handle_message(&message) {
            return response;
        }

        let command = message.command;
        let sender = message.sender_id.clone();
        match self.handle_data_message(message).await {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, StorageNodeError::MalformedMessage(_)) {
                    self.counters.malformed_messages.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropping malformed {:?} from {}: {}", command, sender, e);
                } else {
                    warn!("Handling {:?} from {} failed: {}", command, sender, e);
                }
                PeerResponse::error(self.node_id.clone(), e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InProcessNetwork;
    use crate::storage::{MemoryKnowledgeStore, ValueMerge};
    use crate::types::TruthValue;

    fn single_node(cluster_id: &str) -> Arc<DistributedStorageNode> {
        let config = ClusterConfig {
            cluster_id: cluster_id.into(),
            node_id: Some("solo".into()),
            ..Default::default()
        };
        DistributedStorageNode::new(config, Arc::new(MemoryKnowledgeStore::default()), InProcessNetwork::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_then_fetch_on_owner() {
        let node = single_node("t1");
        let atom = Atom::concept("x").with_truth_value(0.9, 0.3);

        assert!(node.store(atom.clone()).await);
        assert_eq!(node.fetch(&atom.handle).await, Some(atom.clone()));
        assert_eq!(node.planner().lookup(&atom.handle).unwrap().owner, "solo");
        assert_eq!(node.vector_clock().get("solo"), 1);
    }

    #[tokio::test]
    async fn test_local_failure_returns_false() {
        let config = ClusterConfig {
            node_id: Some("solo".into()),
            ..Default::default()
        };
        let node = DistributedStorageNode::new(
            config,
            Arc::new(MemoryKnowledgeStore::with_capacity(0)),
            InProcessNetwork::new(),
        )
        .unwrap();

        assert!(!node.store(Atom::concept("x")).await);
        assert_eq!(node.pending_sync_operations(), 0);
        assert_eq!(node.get_stats().local_failures, 1);
    }

    #[tokio::test]
    async fn test_remove_clears_assignment_and_enqueues() {
        let node = single_node("t1");
        let atom = Atom::concept("x");
        assert!(node.store(atom.clone()).await);
        assert!(node.remove(&atom).await);

        assert_eq!(node.fetch(&atom.handle).await, None);
        assert_eq!(node.planner().lookup(&atom.handle), None);
        assert_eq!(node.pending_sync_operations(), 2);
        assert_eq!(node.distribution_metrics().total_keys, 0);
    }

    #[tokio::test]
    async fn test_replayed_operation_is_idempotent() {
        let node = single_node("t1");
        let mut clock = VectorClock::new();
        clock.increment("remote");
        let operation = SyncOperation::new(
            OperationKind::Add,
            "ConceptNode:y",
            Some(Atom::concept("y").with_truth_value(0.4, 0.2)),
            "remote",
            clock,
        );

        assert_eq!(node.apply_remote_operation(operation.clone()).await.unwrap(), ApplyOutcome::Applied);
        let after_first = node.local_store().all_atoms().await.unwrap();
        assert_eq!(node.apply_remote_operation(operation).await.unwrap(), ApplyOutcome::Ignored);
        assert_eq!(node.local_store().all_atoms().await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_stale_add_does_not_resurrect_removed_key() {
        let node = single_node("t1");
        let atom = Atom::concept("z");
        assert!(node.store(atom.clone()).await);
        let stale = SyncOperation::new(
            OperationKind::Add,
            atom.handle.clone(),
            Some(atom.clone()),
            "solo",
            node.versions.read().get(&atom.handle).unwrap().vector_clock.clone(),
        );
        assert!(node.remove(&atom).await);

        assert_eq!(node.apply_remote_operation(stale).await.unwrap(), ApplyOutcome::Ignored);
        assert_eq!(node.local_store().fetch(&atom.handle).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_message_is_answered_with_error() {
        let node = single_node("t1");
        let message = PeerMessage::new(PeerCommand::ReplicateAtom, "peer", &serde_json::json!({"nope": true})).unwrap();
        let response = node.handle(message).await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(node.get_stats().malformed_messages, 1);
    }

    struct SlowStore {
        inner: MemoryKnowledgeStore,
        delay: std::time::Duration,
    }

    impl ValueMerge for SlowStore {
        fn merge(&self, local: &TruthValue, incoming: &TruthValue) -> TruthValue {
            self.inner.merge(local, incoming)
        }
    }

    #[async_trait]
    impl LocalKnowledgeStore for SlowStore {
        async fn store(&self, atom: Atom) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.store(atom).await
        }

        async fn fetch(&self, handle: &str) -> Result<Option<Atom>> {
            self.inner.fetch(handle).await
        }

        async fn remove(&self, handle: &str) -> Result<bool> {
            self.inner.remove(handle).await
        }

        async fn all_atoms(&self) -> Result<Vec<Atom>> {
            self.inner.all_atoms().await
        }

        async fn size(&self) -> Result<usize> {
            self.inner.size().await
        }
    }

    fn remote_add(source: &str, strength: f64, confidence: f64) -> SyncOperation {
        let mut clock = VectorClock::new();
        clock.increment(source);
        SyncOperation::new(
            OperationKind::Add,
            "ConceptNode:x",
            Some(Atom::concept("x").with_truth_value(strength, confidence)),
            source,
            clock,
        )
    }

    #[tokio::test]
    async fn test_concurrent_applies_on_one_key_are_serialized() {
        let config = ClusterConfig {
            node_id: Some("solo".into()),
            sync_strategy: SyncStrategy::MergeUsingTruthValues,
            ..Default::default()
        };
        let store = SlowStore {
            inner: MemoryKnowledgeStore::default(),
            delay: std::time::Duration::from_millis(50),
        };
        let node = DistributedStorageNode::new(config, Arc::new(store), InProcessNetwork::new()).unwrap();

        let (first, second) = tokio::join!(
            node.apply_remote_operation(remote_add("r1", 0.8, 0.5)),
            node.apply_remote_operation(remote_add("r2", 0.4, 0.3)),
        );
        first.unwrap();
        second.unwrap();

        let atom = node.local_store().fetch("ConceptNode:x").await.unwrap().unwrap();
        assert!((atom.truth_value.strength - 0.65).abs() < 1e-9);
        assert!((atom.truth_value.confidence - 0.8).abs() < 1e-9);
        assert_eq!(node.get_stats().conflicts_detected, 1);
        assert_eq!(node.key_locks.len(), 0);
    }

    #[tokio::test]
    async fn test_non_holder_drops_copy_on_update() {
        let node = single_node("t1");
        node.local_store().store(Atom::concept("x").with_truth_value(0.1, 0.1)).await.unwrap();

        let mut operation = remote_add("r1", 0.9, 0.9);
        operation.kind = OperationKind::Update;
        let operation = operation.with_placement(PartitionAssignment::new("elsewhere", vec![]));

        assert_eq!(node.apply_remote_operation(operation).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(node.local_store().fetch("ConceptNode:x").await.unwrap(), None);
        assert_eq!(node.planner().lookup("ConceptNode:x").unwrap().owner, "elsewhere");
    }

    #[tokio::test]
    async fn test_winning_add_without_atom_keeps_local() {
        let config = ClusterConfig {
            node_id: Some("solo".into()),
            sync_strategy: SyncStrategy::LastWriteWins,
            ..Default::default()
        };
        let node =
            DistributedStorageNode::new(config, Arc::new(MemoryKnowledgeStore::default()), InProcessNetwork::new())
                .unwrap();
        let atom = Atom::concept("x").with_truth_value(0.3, 0.3);
        assert!(node.store(atom.clone()).await);

        let mut empty = remote_add("r1", 0.0, 0.0);
        empty.payload = None;
        let empty = empty.with_timestamp(Utc::now() + chrono::Duration::hours(1));

        assert_eq!(
            node.apply_remote_operation(empty).await.unwrap(),
            ApplyOutcome::Resolved(Resolution::KeepLocal)
        );
        assert_eq!(node.local_store().fetch(&atom.handle).await.unwrap(), Some(atom));
    }

    #[tokio::test]
    async fn test_tombstones_pruned_after_ttl() {
        let node = single_node("t1");
        let kept = Atom::concept("kept");
        let removed = Atom::concept("removed");
        assert!(node.store(kept).await);
        assert!(node.store(removed.clone()).await);
        assert!(node.remove(&removed).await);
        assert_eq!(node.tracked_keys(), 2);

        assert_eq!(node.prune_tombstones_at(Utc::now()), 0);
        let ttl = chrono::Duration::from_std(node.config().sync_operation_ttl()).unwrap();
        assert_eq!(node.prune_tombstones_at(Utc::now() + ttl * 2), 1);
        assert_eq!(node.tracked_keys(), 1);
        assert!(node.versions.read().contains_key("ConceptNode:kept"));
    }

    #[test]
    fn test_balance_score() {
        let empty = DistributionMetrics::from_counts(BTreeMap::from([("a".to_string(), 0), ("b".to_string(), 0)]));
        assert_eq!(empty.balance_score, 1.0);

        let even = DistributionMetrics::from_counts(BTreeMap::from([("a".to_string(), 5), ("b".to_string(), 5)]));
        assert_eq!(even.balance_score, 1.0);

        let skewed = DistributionMetrics::from_counts(BTreeMap::from([("a".to_string(), 10), ("b".to_string(), 0)]));
        assert!((skewed.balance_score - 0.5).abs() < 1e-9);
        assert!(skewed.balance_score > 0.0 && skewed.balance_score <= 1.0);
    }
}

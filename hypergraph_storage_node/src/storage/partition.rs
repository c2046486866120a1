// Partition planning for the distributed atom store
//
// Chooses an owner and a replica set for every key and keeps the resulting
// assignments. Ring positions come from the first eight bytes of a BLAKE3 hash,
// read big-endian, so placement is reproducible on every node.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::error::{Result, StorageNodeError};
use crate::types::{key_category, NodeId, PartitionStrategy, ReplicationStrategy};

/// Owner and replicas of one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    pub owner: NodeId,
    pub replicas: Vec<NodeId>,
}

impl PartitionAssignment {
    pub fn new(owner: impl Into<NodeId>, replicas: Vec<NodeId>) -> Self {
        let owner = owner.into();
        let mut seen = HashSet::new();
        let replicas = replicas
            .into_iter()
            .filter(|r| *r != owner && seen.insert(r.clone()))
            .collect();
        Self { owner, replicas }
    }

    /// True when `node_id` is the owner or one of the replicas
    pub fn is_holder(&self, node_id: &str) -> bool {
        self.owner == node_id || self.replicas.iter().any(|r| r == node_id)
    }

    pub fn holders(&self) -> impl Iterator<Item = &NodeId> {
        std::iter::once(&self.owner).chain(self.replicas.iter())
    }
}

/// Single key move produced by a rebalance or a departure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMigration {
    pub key: String,
    pub from: NodeId,
    pub to: NodeId,
}

/// Result of a rebalance pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalancePlan {
    /// Keys moved, in application order
    pub migrations: Vec<KeyMigration>,
    /// Owned-key count per node before the pass
    pub loads_before: BTreeMap<NodeId, usize>,
    /// Owned-key count per node after the pass
    pub loads_after: BTreeMap<NodeId, usize>,
}

/// Placement settings
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    pub partition_strategy: PartitionStrategy,
    pub replication_strategy: ReplicationStrategy,
    pub replication_factor: usize,
    pub ring_points_per_node: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partition_strategy: PartitionStrategy::HashBased,
            replication_strategy: ReplicationStrategy::PrimaryBackup,
            replication_factor: 2,
            ring_points_per_node: 32,
        }
    }
}

impl From<&ClusterConfig> for PartitionConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            partition_strategy: config.partition_strategy,
            replication_strategy: config.replication_strategy,
            replication_factor: config.replication_factor.max(1),
            ring_points_per_node: config.ring_points_per_node.max(1),
        }
    }
}

/// 64-bit ring position of `data`
pub fn ring_hash(data: &[u8]) -> u64 {
    let hash = blake3::hash(data);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_be_bytes(bytes)
}

/// Sorted (position, node) array with binary-search successor lookup
#[derive(Debug, Clone)]
struct HashRing {
    points: Vec<(u64, NodeId)>,
}

impl HashRing {
    fn build(nodes: &[NodeId], points_per_node: usize, scope: Option<&str>) -> Self {
        let mut points = Vec::with_capacity(nodes.len() * points_per_node);
        for node in nodes {
            for i in 0..points_per_node {
                let label = match scope {
                    Some(scope) => format!("{}/{}#{}", scope, node, i),
                    None => format!("{}#{}", node, i),
                };
                points.push((ring_hash(label.as_bytes()), node.clone()));
            }
        }
        points.sort();
        Self { points }
    }

    fn successor_index(&self, position: u64) -> usize {
        let idx = self.points.partition_point(|(p, _)| *p < position);
        // Wrap around to the first point
        if idx == self.points.len() {
            0
        } else {
            idx
        }
    }

    fn owner(&self, position: u64) -> Option<&NodeId> {
        if self.points.is_empty() {
            return None;
        }
        Some(&self.points[self.successor_index(position)].1)
    }

    /// Distinct nodes clockwise from `position`, first occurrence only
    fn walk(&self, position: u64) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        if self.points.is_empty() {
            return nodes;
        }
        let start = self.successor_index(position);
        for offset in 0..self.points.len() {
            let (_, node) = &self.points[(start + offset) % self.points.len()];
            if seen.insert(node) {
                nodes.push(node.clone());
            }
        }
        nodes
    }
}

#[derive(Debug, Default)]
struct PlacementState {
    partition_map: HashMap<String, NodeId>,
    replica_map: HashMap<String, Vec<NodeId>>,
}

impl PlacementState {
    fn owned_count(&self, node: &str) -> usize {
        self.partition_map.values().filter(|owner| *owner == node).count()
    }

    fn assignment(&self, key: &str) -> Option<PartitionAssignment> {
        self.partition_map.get(key).map(|owner| PartitionAssignment {
            owner: owner.clone(),
            replicas: self.replica_map.get(key).cloned().unwrap_or_default(),
        })
    }

    fn insert(&mut self, key: &str, assignment: &PartitionAssignment) {
        self.partition_map.insert(key.to_string(), assignment.owner.clone());
        self.replica_map.insert(key.to_string(), assignment.replicas.clone());
    }
}

/// Held while a rebalance runs; releases the single-flight flag on drop
pub struct RebalanceGuard<'a> {
    planner: &'a PartitionPlanner,
}

impl RebalanceGuard<'_> {
    /// Plan and apply load-evening moves over `nodes`
    pub fn plan(&self, nodes: &[NodeId]) -> RebalancePlan {
        self.planner.plan_rebalance(nodes)
    }
}

impl Drop for RebalanceGuard<'_> {
    fn drop(&mut self) {
        self.planner.rebalancing.store(false, Ordering::SeqCst);
    }
}

/// Computes and caches key placement
#[derive(Debug)]
pub struct PartitionPlanner {
    config: PartitionConfig,
    state: RwLock<PlacementState>,
    rebalancing: AtomicBool,
}

fn sorted_members(nodes: &[NodeId]) -> Vec<NodeId> {
    let mut members = nodes.to_vec();
    members.sort();
    members.dedup();
    members
}

impl PartitionPlanner {
    pub fn new(config: PartitionConfig) -> Self {
        Self {
            config,
            state: RwLock::new(PlacementState::default()),
            rebalancing: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Owner of `key` among `nodes`.
    ///
    /// A cached owner that is still a member wins; otherwise the configured strategy
    /// decides. Nothing is recorded, so repeated calls agree.
    pub fn assign_owner(&self, key: &str, nodes: &[NodeId]) -> Option<NodeId> {
        let members = sorted_members(nodes);
        let state = self.state.read();
        if let Some(owner) = state.partition_map.get(key) {
            if members.contains(owner) {
                return Some(owner.clone());
            }
        }
        self.compute_owner(key, &members, &state)
    }

    fn compute_owner(&self, key: &str, members: &[NodeId], state: &PlacementState) -> Option<NodeId> {
        if members.is_empty() {
            return None;
        }
        match self.config.partition_strategy {
            PartitionStrategy::RoundRobin => {
                // The counter is the number of keys placed so far
                let counter = state.partition_map.len();
                Some(members[counter % members.len()].clone())
            }
            PartitionStrategy::HashBased => {
                let ring = HashRing::build(members, self.config.ring_points_per_node, None);
                ring.owner(ring_hash(key.as_bytes())).cloned()
            }
            PartitionStrategy::TypeBased => {
                let category = key_category(key);
                let ring = HashRing::build(members, self.config.ring_points_per_node, Some(category));
                ring.owner(ring_hash(key.as_bytes())).cloned()
            }
            PartitionStrategy::LoadBalanced => members
                .iter()
                .min_by(|a, b| {
                    state
                        .owned_count(a)
                        .cmp(&state.owned_count(b))
                        .then_with(|| a.cmp(b))
                })
                .cloned(),
        }
    }

    /// Number of replicas a key gets in a cluster of `member_count` nodes
    pub fn replica_count(&self, member_count: usize) -> usize {
        let others = member_count.saturating_sub(1);
        let backups = self.config.replication_factor.saturating_sub(1);
        match self.config.replication_strategy {
            ReplicationStrategy::SingleCopy => 0,
            ReplicationStrategy::PrimaryBackup => backups.min(others),
            ReplicationStrategy::FullReplication => others,
            ReplicationStrategy::QuorumBased => {
                let quorum_backups = ((member_count + 2) / 2).saturating_sub(1);
                quorum_backups.min(backups).min(others)
            }
        }
    }

    /// Candidate replica order for `key`, owner excluded
    fn replica_candidates(&self, key: &str, owner: &str, members: &[NodeId]) -> Vec<NodeId> {
        match self.config.partition_strategy {
            PartitionStrategy::HashBased | PartitionStrategy::TypeBased => {
                let scope = match self.config.partition_strategy {
                    PartitionStrategy::TypeBased => Some(key_category(key)),
                    _ => None,
                };
                let ring = HashRing::build(members, self.config.ring_points_per_node, scope);
                ring.walk(ring_hash(key.as_bytes()))
                    .into_iter()
                    .filter(|node| node != owner)
                    .collect()
            }
            PartitionStrategy::RoundRobin | PartitionStrategy::LoadBalanced => {
                let start = members.iter().position(|m| m == owner).map(|i| i + 1).unwrap_or(0);
                (0..members.len())
                    .map(|offset| members[(start + offset) % members.len()].clone())
                    .filter(|node| node != owner)
                    .collect()
            }
        }
    }

    /// Replica set for `key` under `owner`; never contains the owner.
    pub fn assign_replicas(&self, key: &str, owner: &str, nodes: &[NodeId]) -> Vec<NodeId> {
        let members = sorted_members(nodes);
        let count = self.replica_count(members.len());
        let mut candidates = self.replica_candidates(key, owner, &members);
        candidates.truncate(count);
        candidates
    }

    /// Keep surviving replicas, drop the owner, then top up in candidate order
    fn reconcile_replicas(&self, key: &str, owner: &str, existing: &[NodeId], members: &[NodeId]) -> Vec<NodeId> {
        let count = self.replica_count(members.len());
        let mut replicas: Vec<NodeId> = Vec::with_capacity(count);
        for node in existing {
            if replicas.len() == count {
                break;
            }
            if node != owner && members.contains(node) && !replicas.contains(node) {
                replicas.push(node.clone());
            }
        }
        if replicas.len() < count {
            for node in self.replica_candidates(key, owner, members) {
                if replicas.len() == count {
                    break;
                }
                if !replicas.contains(&node) {
                    replicas.push(node);
                }
            }
        }
        replicas
    }

    /// Assign `key` and record the assignment.
    ///
    /// A cached assignment with a live owner is kept; its replica set is repaired
    /// against the current membership.
    pub fn place(&self, key: &str, nodes: &[NodeId]) -> Option<PartitionAssignment> {
        let members = sorted_members(nodes);
        let mut state = self.state.write();

        let assignment = match state.assignment(key) {
            Some(cached) if members.contains(&cached.owner) => {
                let replicas = self.reconcile_replicas(key, &cached.owner, &cached.replicas, &members);
                PartitionAssignment::new(cached.owner, replicas)
            }
            _ => {
                let owner = self.compute_owner(key, &members, &state)?;
                let replicas = self.reconcile_replicas(key, &owner, &[], &members);
                PartitionAssignment::new(owner, replicas)
            }
        };

        state.insert(key, &assignment);
        Some(assignment)
    }

    /// Recorded assignment of `key`, if any
    pub fn lookup(&self, key: &str) -> Option<PartitionAssignment> {
        self.state.read().assignment(key)
    }

    /// Record an assignment chosen elsewhere
    pub fn record(&self, key: &str, assignment: &PartitionAssignment) {
        let assignment = PartitionAssignment::new(assignment.owner.clone(), assignment.replicas.clone());
        self.state.write().insert(key, &assignment);
    }

    /// Remember `owner` as the owner of `key`, keeping known replicas
    pub fn record_owner(&self, key: &str, owner: &str) {
        let mut state = self.state.write();
        let replicas = state.replica_map.get(key).cloned().unwrap_or_default();
        let assignment = PartitionAssignment::new(owner, replicas);
        state.insert(key, &assignment);
    }

    /// Drop the partition and replica entries of `key` together
    pub fn forget(&self, key: &str) -> Option<PartitionAssignment> {
        let mut state = self.state.write();
        let assignment = state.assignment(key);
        state.partition_map.remove(key);
        state.replica_map.remove(key);
        assignment
    }

    pub fn key_count(&self) -> usize {
        self.state.read().partition_map.len()
    }

    /// Owned-key count per node; members with no keys report zero.
    pub fn owned_counts(&self, nodes: &[NodeId]) -> BTreeMap<NodeId, usize> {
        let state = self.state.read();
        let mut counts: BTreeMap<NodeId, usize> = nodes.iter().map(|n| (n.clone(), 0)).collect();
        for owner in state.partition_map.values() {
            *counts.entry(owner.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Keys owned by `node_id`, sorted
    pub fn keys_owned_by(&self, node_id: &str) -> Vec<String> {
        let state = self.state.read();
        let mut keys: Vec<String> = state
            .partition_map
            .iter()
            .filter(|(_, owner)| *owner == node_id)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Claim the single-flight rebalance slot
    pub fn begin_rebalance(&self) -> Result<RebalanceGuard<'_>> {
        self.rebalancing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| StorageNodeError::RebalanceInProgress)?;
        Ok(RebalanceGuard { planner: self })
    }

    pub fn is_rebalancing(&self) -> bool {
        self.rebalancing.load(Ordering::SeqCst)
    }

    /// Single-flight plan-and-apply; see [`RebalanceGuard::plan`]
    pub fn rebalance(&self, nodes: &[NodeId]) -> Result<RebalancePlan> {
        let guard = self.begin_rebalance()?;
        Ok(guard.plan(nodes))
    }

    /// Move keys from nodes above 1.2x the average load to nodes below 0.8x,
    /// one key at a time, until every load is in band or no move helps.
    fn plan_rebalance(&self, nodes: &[NodeId]) -> RebalancePlan {
        let members = sorted_members(nodes);
        let mut state = self.state.write();

        let mut owned: BTreeMap<NodeId, Vec<String>> =
            members.iter().map(|m| (m.clone(), Vec::new())).collect();
        for (key, owner) in &state.partition_map {
            if let Some(keys) = owned.get_mut(owner) {
                keys.push(key.clone());
            }
        }
        for keys in owned.values_mut() {
            keys.sort();
        }

        let loads_before: BTreeMap<NodeId, usize> =
            owned.iter().map(|(n, keys)| (n.clone(), keys.len())).collect();
        let mut plan = RebalancePlan {
            loads_before: loads_before.clone(),
            loads_after: loads_before,
            ..Default::default()
        };

        let total: usize = plan.loads_before.values().sum();
        if members.len() < 2 || total == 0 {
            return plan;
        }

        let average = total as f64 / members.len() as f64;
        let upper = average * 1.2;
        let lower = average * 0.8;

        loop {
            // max_by_key keeps the last maximum, so iterate in reverse for the smallest id on ties
            let donor = owned
                .iter()
                .rev()
                .max_by_key(|(_, keys)| keys.len())
                .map(|(n, keys)| (n.clone(), keys.len()));
            let receiver = owned
                .iter()
                .min_by_key(|(_, keys)| keys.len())
                .map(|(n, keys)| (n.clone(), keys.len()));

            let (Some((donor, donor_load)), Some((receiver, receiver_load))) = (donor, receiver) else {
                break;
            };

            let in_band = donor_load as f64 <= upper && receiver_load as f64 >= lower;
            if in_band || donor_load < receiver_load + 2 {
                break;
            }

            let Some(key) = owned.get_mut(&donor).and_then(|keys| keys.pop()) else {
                break;
            };
            if let Some(keys) = owned.get_mut(&receiver) {
                keys.push(key.clone());
            }
            plan.migrations.push(KeyMigration {
                key,
                from: donor,
                to: receiver,
            });
        }

        for migration in &plan.migrations {
            let existing = state.replica_map.get(&migration.key).cloned().unwrap_or_default();
            let replicas = self.reconcile_replicas(&migration.key, &migration.to, &existing, &members);
            let assignment = PartitionAssignment::new(migration.to.clone(), replicas);
            state.insert(&migration.key, &assignment);
        }

        plan.loads_after = owned.iter().map(|(n, keys)| (n.clone(), keys.len())).collect();
        if !plan.migrations.is_empty() {
            info!(
                "Rebalance moved {} keys across {} nodes",
                plan.migrations.len(),
                members.len()
            );
        }
        plan
    }

    /// Reassign everything `departed` owned and strip it from replica sets.
    ///
    /// A surviving replica is promoted when one exists; otherwise the owner is
    /// recomputed over `remaining`.
    pub fn on_node_departure(&self, departed: &str, remaining: &[NodeId]) -> Vec<KeyMigration> {
        let members: Vec<NodeId> = sorted_members(remaining)
            .into_iter()
            .filter(|n| n != departed)
            .collect();
        let mut state = self.state.write();
        let mut migrations = Vec::new();

        let mut orphaned: Vec<String> = state
            .partition_map
            .iter()
            .filter(|(_, owner)| *owner == departed)
            .map(|(key, _)| key.clone())
            .collect();
        orphaned.sort();

        for key in orphaned {
            let survivors: Vec<NodeId> = state
                .replica_map
                .get(&key)
                .map(|replicas| {
                    replicas
                        .iter()
                        .filter(|r| *r != departed && members.contains(*r))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            let new_owner = match survivors.first() {
                Some(promoted) => Some(promoted.clone()),
                None => self.compute_owner(&key, &members, &state),
            };

            match new_owner {
                Some(owner) => {
                    debug!("Key {} moves from departed {} to {}", key, departed, owner);
                    let replicas = self.reconcile_replicas(&key, &owner, &survivors, &members);
                    state.insert(&key, &PartitionAssignment::new(owner.clone(), replicas));
                    migrations.push(KeyMigration {
                        key,
                        from: departed.to_string(),
                        to: owner,
                    });
                }
                None => {
                    state.partition_map.remove(&key);
                    state.replica_map.remove(&key);
                }
            }
        }

        let stale: Vec<String> = state
            .replica_map
            .iter()
            .filter(|(_, replicas)| replicas.iter().any(|r| r == departed))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            let Some(owner) = state.partition_map.get(&key).cloned() else {
                continue;
            };
            let existing = state.replica_map.get(&key).cloned().unwrap_or_default();
            let replicas = self.reconcile_replicas(&key, &owner, &existing, &members);
            state.replica_map.insert(key, replicas);
        }

        migrations
    }
}

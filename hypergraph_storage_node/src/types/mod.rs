// Types module for the hypergraph storage node
//
// Shared data types: cluster participants, atoms and the strategy enums
// selected through configuration.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque, stable identifier of a cluster participant
pub type NodeId = String;

/// Longest accepted peer staleness threshold, one year
pub const MAX_STALE_THRESHOLD_MINUTES: u64 = 365 * 24 * 60;

/// Lifecycle status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Node is starting up and has not joined yet
    Initializing,
    /// Node is taking part in the cluster
    Active,
    /// Node left or stopped answering
    Offline,
    /// Node reported an unrecoverable failure
    Failed,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeStatus::Initializing => "initializing",
            NodeStatus::Active => "active",
            NodeStatus::Offline => "offline",
            NodeStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What this node knows about a cluster participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Node identifier
    pub id: NodeId,
    /// Host name or IP address
    pub host: String,
    /// Peer protocol port
    pub port: u16,
    /// Human-readable name
    pub display_name: String,
    /// Last reported status
    pub status: NodeStatus,
    /// Time of the last heartbeat received from the node
    pub last_heartbeat: DateTime<Utc>,
}

impl PeerInfo {
    pub fn new(id: impl Into<NodeId>, host: impl Into<String>, port: u16) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            host: host.into(),
            port,
            status: NodeStatus::Initializing,
            last_heartbeat: Utc::now(),
        }
    }

    /// "host:port" form used for addressing the peer
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True when the last heartbeat is older than `threshold_minutes` at `now`.
    pub fn is_stale(&self, threshold_minutes: u64, now: DateTime<Utc>) -> bool {
        let threshold = Duration::minutes(threshold_minutes.min(MAX_STALE_THRESHOLD_MINUTES) as i64);
        now.signed_duration_since(self.last_heartbeat) > threshold
    }
}

/// Strength/confidence pair attached to every atom
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TruthValue {
    pub strength: f64,
    pub confidence: f64,
}

impl TruthValue {
    pub fn new(strength: f64, confidence: f64) -> Self {
        Self {
            strength,
            confidence,
        }
    }
}

impl Default for TruthValue {
    fn default() -> Self {
        Self {
            strength: 1.0,
            confidence: 0.0,
        }
    }
}

/// Unit of data distributed by the cluster
///
/// Handles are content-derived: `Type:name` for nodes and `Type(h1,h2,...)` for links,
/// so the same atom created on two nodes maps to the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    /// Key under which the atom is partitioned
    pub handle: String,
    /// Atom type, e.g. `ConceptNode` or `InheritanceLink`
    pub atom_type: String,
    /// Node name; empty for links
    #[serde(default)]
    pub name: String,
    /// Handles of the atoms a link points at
    #[serde(default)]
    pub outgoing: Vec<String>,
    /// Truth value
    #[serde(default)]
    pub truth_value: TruthValue,
}

impl Atom {
    /// Create a node atom
    pub fn node(atom_type: impl Into<String>, name: impl Into<String>) -> Self {
        let atom_type = atom_type.into();
        let name = name.into();
        Self {
            handle: format!("{}:{}", atom_type, name),
            atom_type,
            name,
            outgoing: Vec::new(),
            truth_value: TruthValue::default(),
        }
    }

    /// Create a link atom over existing handles
    pub fn link(atom_type: impl Into<String>, outgoing: Vec<String>) -> Self {
        let atom_type = atom_type.into();
        Self {
            handle: format!("{}({})", atom_type, outgoing.join(",")),
            atom_type,
            name: String::new(),
            outgoing,
            truth_value: TruthValue::default(),
        }
    }

    pub fn concept(name: impl Into<String>) -> Self {
        Self::node("ConceptNode", name)
    }

    pub fn with_truth_value(mut self, strength: f64, confidence: f64) -> Self {
        self.truth_value = TruthValue::new(strength, confidence);
        self
    }

    pub fn is_link(&self) -> bool {
        !self.outgoing.is_empty()
    }
}

/// Key-type category of a handle: the type prefix before `:` or `(`.
pub fn key_category(handle: &str) -> &str {
    match handle.find(|c| c == ':' || c == '(') {
        Some(idx) => &handle[..idx],
        None => handle,
    }
}

/// Ordered collection of atoms keyed by handle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AtomSpace {
    atoms: BTreeMap<String, Atom>,
}

impl AtomSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an atom, replacing any atom with the same handle
    pub fn insert(&mut self, atom: Atom) -> Option<Atom> {
        self.atoms.insert(atom.handle.clone(), atom)
    }

    pub fn get(&self, handle: &str) -> Option<&Atom> {
        self.atoms.get(handle)
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.atoms.contains_key(handle)
    }

    pub fn remove(&mut self, handle: &str) -> Option<Atom> {
        self.atoms.remove(handle)
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Atom> {
        self.atoms.values()
    }
}

impl FromIterator<Atom> for AtomSpace {
    fn from_iter<I: IntoIterator<Item = Atom>>(iter: I) -> Self {
        let mut space = AtomSpace::new();
        for atom in iter {
            space.insert(atom);
        }
        space
    }
}

/// How concurrent updates to one key are reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStrategy {
    /// Newer timestamp wins, ties broken by source node id
    LastWriteWins,
    /// Truth values are merged through the local store's merge contract
    MergeUsingTruthValues,
    /// Causally dominant value wins, concurrent values are merged
    VectorClock,
}

/// How a key's owner is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStrategy {
    /// Keys are dealt to sorted nodes in assignment order
    RoundRobin,
    /// Consistent-hash ring over node ids
    HashBased,
    /// Consistent-hash ring per key-type category
    TypeBased,
    /// Node with the fewest owned keys
    LoadBalanced,
}

/// How many copies of a key exist besides the owner's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationStrategy {
    /// Owner only
    SingleCopy,
    /// `replication_factor - 1` backups
    PrimaryBackup,
    /// Every other known node
    FullReplication,
    /// Enough backups to form a majority, capped by the replication factor
    QuorumBased,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_handles() {
        let x = Atom::concept("x");
        assert_eq!(x.handle, "ConceptNode:x");
        assert!(!x.is_link());

        let link = Atom::link("InheritanceLink", vec![x.handle.clone(), "ConceptNode:y".into()]);
        assert_eq!(link.handle, "InheritanceLink(ConceptNode:x,ConceptNode:y)");
        assert!(link.is_link());

        assert_eq!(key_category(&x.handle), "ConceptNode");
        assert_eq!(key_category(&link.handle), "InheritanceLink");
        assert_eq!(key_category("opaque"), "opaque");
    }

    #[test]
    fn test_peer_staleness() {
        let mut peer = PeerInfo::new("n1", "127.0.0.1", 7000);
        let now = Utc::now();
        peer.last_heartbeat = now - Duration::minutes(3);
        assert!(!peer.is_stale(5, now));
        assert!(peer.is_stale(2, now));
        assert_eq!(peer.address(), "127.0.0.1:7000");

        // Out-of-range thresholds are clamped instead of overflowing
        assert!(!peer.is_stale(u64::MAX, now));
    }

    #[test]
    fn test_atom_space_replaces_by_handle() {
        let mut space = AtomSpace::new();
        space.insert(Atom::concept("x"));
        let previous = space.insert(Atom::concept("x").with_truth_value(0.5, 0.5));
        assert!(previous.is_some());
        assert_eq!(space.len(), 1);
        assert_eq!(space.get("ConceptNode:x").map(|a| a.truth_value.strength), Some(0.5));
    }
}

// Storage module for the hypergraph storage node
//
// Local knowledge stores behind a narrow async interface, plus the building blocks
// of the distributed layer: vector clocks, conflict resolution, the sync queue,
// partition planning and the node that ties them together.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Atom, AtomSpace, TruthValue};

pub mod conflict;
pub mod distributed_storage;
mod key_locks;
pub mod memory_storage;
pub mod partition;
pub mod sql_storage;
pub mod sync_queue;
pub mod vector_clock;

pub use conflict::{ConflictInfo, ConflictResolver, Resolution, VersionedAtom};
pub use distributed_storage::{ApplyOutcome, ClusterStats, DistributedStorageNode, DistributionMetrics, NodeStats};
pub use memory_storage::MemoryKnowledgeStore;
pub use partition::{PartitionAssignment, PartitionPlanner, RebalancePlan};
pub use sql_storage::SqlKnowledgeStore;
pub use sync_queue::{OperationKind, SyncOperation, SyncQueue};
pub use vector_clock::{VectorClock, VectorClockRelation};

/// Truth-value merge contract used during conflict resolution
pub trait ValueMerge {
    fn merge(&self, local: &TruthValue, incoming: &TruthValue) -> TruthValue;
}

/// Confidence-weighted average of strengths; confidences are summed and capped at 1.0.
pub fn merge_truth_values(a: &TruthValue, b: &TruthValue) -> TruthValue {
    let total = a.confidence + b.confidence;
    let strength = if total > 0.0 {
        (a.strength * a.confidence + b.strength * b.confidence) / total
    } else {
        (a.strength + b.strength) / 2.0
    };
    TruthValue::new(strength, total.min(1.0))
}

/// Stateless merger applying [`merge_truth_values`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultValueMerge;

impl ValueMerge for DefaultValueMerge {
    fn merge(&self, local: &TruthValue, incoming: &TruthValue) -> TruthValue {
        merge_truth_values(local, incoming)
    }
}

/// Local knowledge store the distributed layer delegates persistence to
#[async_trait]
pub trait LocalKnowledgeStore: ValueMerge + Send + Sync {
    /// Persist an atom, replacing any atom with the same handle
    async fn store(&self, atom: Atom) -> Result<()>;

    /// Look up an atom by handle
    async fn fetch(&self, handle: &str) -> Result<Option<Atom>>;

    /// Remove an atom, returning whether it existed
    async fn remove(&self, handle: &str) -> Result<bool>;

    /// Persist every atom of `space`
    async fn store_all(&self, space: &AtomSpace) -> Result<()> {
        for atom in space.iter() {
            self.store(atom.clone()).await?;
        }
        Ok(())
    }

    /// Load every stored atom into `space`
    async fn load_all(&self, space: &mut AtomSpace) -> Result<()> {
        for atom in self.all_atoms().await? {
            space.insert(atom);
        }
        Ok(())
    }

    /// Snapshot of every stored atom
    async fn all_atoms(&self) -> Result<Vec<Atom>>;

    /// Number of stored atoms
    async fn size(&self) -> Result<usize>;
}

// Sync operation model and the queue of pending propagations
//
// Operations are immutable once recorded. The sync loop drains the queue, delivers
// each operation, and puts back the ones that could not reach every recipient
// until they expire.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

use super::partition::PartitionAssignment;
use super::vector_clock::VectorClock;
use crate::types::{Atom, NodeId};

/// Kind of mutation carried by a sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Add,
    Update,
    Remove,
}

/// Recorded intent to propagate one local mutation to peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Unique operation id
    pub id: Uuid,
    /// Mutation kind
    pub kind: OperationKind,
    /// Atom handle the operation applies to
    pub key: String,
    /// Snapshot of the atom at mutation time; absent for removals
    pub payload: Option<Atom>,
    /// Node that originated the mutation
    pub source_node: NodeId,
    /// Recipient, or every known peer when absent
    pub target_node: Option<NodeId>,
    /// Version of the key after the mutation
    pub vector_clock: VectorClock,
    /// Wall-clock time of the mutation
    pub timestamp: DateTime<Utc>,
    /// Owner and replicas chosen by the originating node
    #[serde(default)]
    pub placement: Option<PartitionAssignment>,
}

impl SyncOperation {
    pub fn new(
        kind: OperationKind,
        key: impl Into<String>,
        payload: Option<Atom>,
        source_node: impl Into<NodeId>,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            key: key.into(),
            payload,
            source_node: source_node.into(),
            target_node: None,
            vector_clock,
            timestamp: Utc::now(),
            placement: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<NodeId>) -> Self {
        self.target_node = Some(target.into());
        self
    }

    pub fn with_placement(mut self, placement: PartitionAssignment) -> Self {
        self.placement = Some(placement);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_node.is_none()
    }

    /// True when the operation is older than `ttl` at `now`
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match ChronoDuration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(self.timestamp) > ttl,
            Err(_) => false,
        }
    }
}

/// FIFO of operations waiting for delivery
#[derive(Debug, Default)]
pub struct SyncQueue {
    operations: Mutex<VecDeque<SyncOperation>>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, operation: SyncOperation) {
        self.operations.lock().push_back(operation);
    }

    /// Take every queued operation, oldest first
    pub fn drain(&self) -> Vec<SyncOperation> {
        self.operations.lock().drain(..).collect()
    }

    /// Put undelivered operations back ahead of anything queued since the drain
    pub fn requeue(&self, operations: Vec<SyncOperation>) {
        let mut queue = self.operations.lock();
        for operation in operations.into_iter().rev() {
            queue.push_front(operation);
        }
    }

    /// Drop operations older than `ttl`, returning how many were dropped
    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let now = Utc::now();
        let mut queue = self.operations.lock();
        let before = queue.len();
        queue.retain(|op| !op.is_expired(ttl, now));
        before - queue.len()
    }

    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(key: &str) -> SyncOperation {
        SyncOperation::new(OperationKind::Add, key, Some(Atom::concept(key)), "n1", VectorClock::new())
    }

    #[test]
    fn test_requeue_preserves_order() {
        let queue = SyncQueue::new();
        queue.push(add("a"));
        queue.push(add("b"));

        let drained = queue.drain();
        assert!(queue.is_empty());

        queue.push(add("c"));
        queue.requeue(drained);

        let keys: Vec<String> = queue.drain().into_iter().map(|op| op.key).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_purge_expired() {
        let queue = SyncQueue::new();
        queue.push(add("old").with_timestamp(Utc::now() - ChronoDuration::minutes(30)));
        queue.push(add("fresh"));

        assert_eq!(queue.purge_expired(Duration::from_secs(60)), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain()[0].key, "fresh");
    }

    #[test]
    fn test_operation_defaults_to_broadcast() {
        let op = add("x");
        assert!(op.is_broadcast());
        assert!(!op.clone().with_target("n2").is_broadcast());
    }
}

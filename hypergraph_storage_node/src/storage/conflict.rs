// Conflict resolution between a local version and an incoming operation
//
// The resolver is a pure function of its inputs: the configured strategy, the
// conflicting operation, the local version, and the store's truth-value merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sync_queue::SyncOperation;
use super::vector_clock::{VectorClock, VectorClockRelation};
use super::ValueMerge;
use crate::types::{Atom, NodeId, SyncStrategy};

/// A concurrent update detected while applying a remote operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub operation: SyncOperation,
    pub reason: String,
}

impl ConflictInfo {
    pub fn concurrent(operation: SyncOperation, local_clock: &VectorClock) -> Self {
        let reason = format!(
            "concurrent update of {} from {} (local clock {:?}, incoming {:?})",
            operation.key, operation.source_node, local_clock, operation.vector_clock
        );
        Self { operation, reason }
    }
}

/// Local state of a key as seen by the resolver
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedAtom {
    /// Current value; `None` when the key was removed locally
    pub atom: Option<Atom>,
    pub vector_clock: VectorClock,
    pub timestamp: DateTime<Utc>,
    pub source_node: NodeId,
}

/// Outcome of a resolution
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Local value stays as it is
    KeepLocal,
    /// Incoming operation is applied as sent
    ApplyIncoming,
    /// Both values were combined into a new one
    Merged(Atom),
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    strategy: SyncStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: SyncStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> SyncStrategy {
        self.strategy
    }

    /// Decide between the local version and the operation carried by `conflict`.
    pub fn resolve<M>(&self, conflict: &ConflictInfo, local: &VersionedAtom, merger: &M) -> Resolution
    where
        M: ValueMerge + ?Sized,
    {
        let incoming = &conflict.operation;
        match self.strategy {
            SyncStrategy::LastWriteWins => Self::last_write_wins(incoming, local),
            SyncStrategy::MergeUsingTruthValues => {
                Self::merge_values(local.atom.as_ref(), incoming.payload.as_ref(), merger)
            }
            SyncStrategy::VectorClock => match incoming.vector_clock.compare(&local.vector_clock) {
                VectorClockRelation::After => Resolution::ApplyIncoming,
                VectorClockRelation::Before | VectorClockRelation::Equal => Resolution::KeepLocal,
                // Neither side dominates: fall back to the truth-value merge
                VectorClockRelation::Concurrent => {
                    Self::merge_values(local.atom.as_ref(), incoming.payload.as_ref(), merger)
                }
            },
        }
    }

    fn last_write_wins(incoming: &SyncOperation, local: &VersionedAtom) -> Resolution {
        let incoming_key = (incoming.timestamp, incoming.source_node.as_str());
        let local_key = (local.timestamp, local.source_node.as_str());
        if incoming_key > local_key {
            Resolution::ApplyIncoming
        } else {
            Resolution::KeepLocal
        }
    }

    /// Absence loses to presence, so a removal never beats a concurrent update here.
    fn merge_values<M>(local: Option<&Atom>, incoming: Option<&Atom>, merger: &M) -> Resolution
    where
        M: ValueMerge + ?Sized,
    {
        match (local, incoming) {
            (Some(local), Some(incoming)) => {
                let mut merged = local.clone();
                merged.truth_value = merger.merge(&local.truth_value, &incoming.truth_value);
                Resolution::Merged(merged)
            }
            (None, Some(_)) => Resolution::ApplyIncoming,
            (Some(_), None) | (None, None) => Resolution::KeepLocal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sync_queue::OperationKind;
    use crate::storage::DefaultValueMerge;
    use chrono::Duration;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries.iter().map(|(n, v)| (n.to_string(), *v)).collect()
    }

    fn local(source: &str, at: DateTime<Utc>, strength: f64, confidence: f64) -> VersionedAtom {
        VersionedAtom {
            atom: Some(Atom::concept("x").with_truth_value(strength, confidence)),
            vector_clock: clock(&[(source, 1)]),
            timestamp: at,
            source_node: source.to_string(),
        }
    }

    fn incoming(source: &str, at: DateTime<Utc>, strength: f64, confidence: f64) -> ConflictInfo {
        let op = SyncOperation::new(
            OperationKind::Update,
            "ConceptNode:x",
            Some(Atom::concept("x").with_truth_value(strength, confidence)),
            source,
            clock(&[(source, 1)]),
        )
        .with_timestamp(at);
        ConflictInfo::concurrent(op, &VectorClock::new())
    }

    #[test]
    fn test_last_write_wins_prefers_later_timestamp() {
        let resolver = ConflictResolver::new(SyncStrategy::LastWriteWins);
        let now = Utc::now();

        let newer = incoming("a", now + Duration::seconds(1), 0.1, 0.1);
        assert_eq!(resolver.resolve(&newer, &local("z", now, 0.9, 0.9), &DefaultValueMerge),
            Resolution::ApplyIncoming);

        let older = incoming("z", now - Duration::seconds(1), 0.1, 0.1);
        assert_eq!(resolver.resolve(&older, &local("a", now, 0.9, 0.9), &DefaultValueMerge),
            Resolution::KeepLocal);
    }

    #[test]
    fn test_last_write_wins_tie_uses_source_id() {
        let resolver = ConflictResolver::new(SyncStrategy::LastWriteWins);
        let now = Utc::now();

        let from_b = incoming("node-b", now, 0.1, 0.1);
        let local_a = local("node-a", now, 0.9, 0.9);
        assert_eq!(resolver.resolve(&from_b, &local_a, &DefaultValueMerge), Resolution::ApplyIncoming);

        let from_a = incoming("node-a", now, 0.1, 0.1);
        let local_b = local("node-b", now, 0.9, 0.9);
        assert_eq!(resolver.resolve(&from_a, &local_b, &DefaultValueMerge), Resolution::KeepLocal);

        // Same inputs, same answer
        for _ in 0..10 {
            assert_eq!(resolver.resolve(&from_a, &local_b, &DefaultValueMerge), Resolution::KeepLocal);
        }
    }

    #[test]
    fn test_merge_applies_truth_value_formula() {
        let resolver = ConflictResolver::new(SyncStrategy::MergeUsingTruthValues);
        let now = Utc::now();

        let resolution = resolver.resolve(
            &incoming("b", now, 0.4, 0.3),
            &local("a", now - Duration::seconds(5), 0.8, 0.5),
            &DefaultValueMerge,
        );
        match resolution {
            Resolution::Merged(atom) => {
                assert!((atom.truth_value.strength - 0.65).abs() < 1e-9);
                assert!((atom.truth_value.confidence - 0.8).abs() < 1e-9);
            }
            other => panic!("expected merge, got {:?}", other),
        }
    }

    #[test]
    fn test_vector_clock_dominance_and_fallback() {
        let resolver = ConflictResolver::new(SyncStrategy::VectorClock);
        let now = Utc::now();

        let mut dominant = incoming("b", now, 0.4, 0.3);
        dominant.operation.vector_clock = clock(&[("a", 1), ("b", 1)]);
        assert_eq!(resolver.resolve(&dominant, &local("a", now, 0.8, 0.5), &DefaultValueMerge),
            Resolution::ApplyIncoming);

        let mut stale = incoming("b", now, 0.4, 0.3);
        stale.operation.vector_clock = VectorClock::new();
        assert_eq!(resolver.resolve(&stale, &local("a", now, 0.8, 0.5), &DefaultValueMerge),
            Resolution::KeepLocal);

        let concurrent = incoming("b", now, 0.4, 0.3);
        assert!(matches!(
            resolver.resolve(&concurrent, &local("a", now, 0.8, 0.5), &DefaultValueMerge),
            Resolution::Merged(_)
        ));
    }

    #[test]
    fn test_removal_loses_to_concurrent_update_when_merging() {
        let resolver = ConflictResolver::new(SyncStrategy::MergeUsingTruthValues);
        let now = Utc::now();

        let mut removal = incoming("b", now, 0.0, 0.0);
        removal.operation.kind = OperationKind::Remove;
        removal.operation.payload = None;
        assert_eq!(resolver.resolve(&removal, &local("a", now, 0.8, 0.5), &DefaultValueMerge),
            Resolution::KeepLocal);

        let mut tombstone = local("a", now, 0.8, 0.5);
        tombstone.atom = None;
        assert_eq!(resolver.resolve(&incoming("b", now, 0.4, 0.3), &tombstone, &DefaultValueMerge),
            Resolution::ApplyIncoming);
    }
}

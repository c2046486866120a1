// Vector clocks for causal ordering of mutations
//
// One counter per node. Entries only ever grow: `increment` bumps the local
// counter on a locally originated mutation, `merge` takes the entrywise max on
// receipt of a remote operation.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::types::NodeId;

/// Causal relation between two clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorClockRelation {
    /// Left happened before right
    Before,
    /// Left happened after right
    After,
    /// Neither dominates the other
    Concurrent,
    /// Identical clocks
    Equal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the counter of `node_id` and return its new value
    pub fn increment(&mut self, node_id: &str) -> u64 {
        let counter = self.counters.entry(node_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Entrywise maximum with `other`
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, &value) in &other.counters {
            let entry = self.counters.entry(node.clone()).or_insert(0);
            if value > *entry {
                *entry = value;
            }
        }
    }

    /// Merged copy, leaving both operands untouched
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut clock = self.clone();
        clock.merge(other);
        clock
    }

    pub fn get(&self, node_id: &str) -> u64 {
        self.counters.get(node_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counters.values().all(|&v| v == 0)
    }

    /// Causal relation of `self` relative to `other`; missing entries count as zero.
    pub fn compare(&self, other: &VectorClock) -> VectorClockRelation {
        let mut less = false;
        let mut greater = false;

        for node in self.counters.keys().chain(other.counters.keys()) {
            match self.get(node).cmp(&other.get(node)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return VectorClockRelation::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => VectorClockRelation::Equal,
            (true, false) => VectorClockRelation::Before,
            (false, true) => VectorClockRelation::After,
            (true, true) => VectorClockRelation::Concurrent,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.counters.iter()
    }
}

impl FromIterator<(NodeId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (NodeId, u64)>>(iter: I) -> Self {
        Self {
            counters: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries.iter().map(|(n, v)| (n.to_string(), *v)).collect()
    }

    #[test]
    fn test_compare_relations() {
        let a = clock(&[("a", 1)]);
        let b = clock(&[("a", 1), ("b", 1)]);
        let c = clock(&[("b", 2)]);

        assert_eq!(a.compare(&a.clone()), VectorClockRelation::Equal);
        assert_eq!(a.compare(&b), VectorClockRelation::Before);
        assert_eq!(b.compare(&a), VectorClockRelation::After);
        assert_eq!(a.compare(&c), VectorClockRelation::Concurrent);
        assert_eq!(VectorClock::new().compare(&clock(&[("a", 0)])), VectorClockRelation::Equal);
    }

    #[test]
    fn test_increment_dominates_previous() {
        let mut clock = VectorClock::new();
        let before = clock.clone();
        assert_eq!(clock.increment("n1"), 1);
        assert_eq!(clock.increment("n1"), 2);
        assert_eq!(before.compare(&clock), VectorClockRelation::Before);
    }

    #[test]
    fn test_merge_is_idempotent_and_commutative() {
        let a = clock(&[("a", 3), ("b", 1)]);
        let b = clock(&[("b", 4), ("c", 2)]);

        let ab = a.merged(&b);
        assert_eq!(ab, b.merged(&a));
        assert_eq!(ab.merged(&b), ab);
        assert_eq!(ab, clock(&[("a", 3), ("b", 4), ("c", 2)]));
    }
}

// Cluster lifecycle events and their observers

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

use crate::types::NodeId;

/// Something observers may want to react to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// A peer was registered
    NodeJoined,
    /// A peer left or was evicted
    NodeLeft,
    /// A rebalance moved `moved` keys
    PartitionRebalanced { moved: usize },
    /// A sync round delivered `operations` operations
    SyncCompleted { operations: usize },
    /// A concurrent update of `key` was resolved
    ConflictDetected { key: String },
}

/// Observer of cluster events. Called synchronously; must return promptly.
pub trait ClusterEventListener: Send + Sync {
    fn on_event(&self, event: &ClusterEvent, node_id: &NodeId);
}

impl<F> ClusterEventListener for F
where
    F: Fn(&ClusterEvent, &NodeId) + Send + Sync,
{
    fn on_event(&self, event: &ClusterEvent, node_id: &NodeId) {
        self(event, node_id)
    }
}

/// Listeners in registration order
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn ClusterEventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn ClusterEventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `event` to every listener. A panicking listener is logged and skipped.
    pub fn emit(&self, event: ClusterEvent, node_id: &NodeId) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(&event, node_id)));
            if outcome.is_err() {
                error!("Cluster event listener panicked while handling {:?} for {}", event, node_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_listeners_run_in_order_despite_failures() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        bus.subscribe(Arc::new(move |_: &ClusterEvent, node: &NodeId| {
            first.lock().push(format!("first:{}", node));
        }));
        bus.subscribe(Arc::new(|_: &ClusterEvent, _: &NodeId| panic!("listener failure")));
        let third = seen.clone();
        bus.subscribe(Arc::new(move |event: &ClusterEvent, _: &NodeId| {
            third.lock().push(format!("third:{:?}", event));
        }));

        bus.emit(ClusterEvent::NodeJoined, &"n2".to_string());
        assert_eq!(
            *seen.lock(),
            vec!["first:n2".to_string(), "third:NodeJoined".to_string()]
        );
        assert_eq!(bus.listener_count(), 3);
    }
}

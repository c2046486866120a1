// Cluster module: membership, liveness and lifecycle events

pub mod events;
pub mod membership;

pub use events::{ClusterEvent, ClusterEventListener, EventBus};
pub use membership::{parse_address, ClusterMembership, MembershipConfig, MembershipStats};

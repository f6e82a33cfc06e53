//! Cluster membership and event broadcast.
//!
//! The cluster layer gives every node the same answer to "where am I in the
//! cluster, and am I the coordinator?", and carries small events between
//! nodes so a wake-up signal raised on one node reaches the actors running on
//! another.
//!
//! # Architecture
//!
//! - `GroupMembership`: the transport seam (membership view + broadcast)
//! - `InMemoryGroup`: an in-process transport for tests and single-process deployments
//! - `ClusterCoordinator`: computes and publishes `ClusterNodeInfo`, dispatches events
//! - `ClusterEvent`: an event tagged with the categories it is delivered under
//!
//! Broadcast is an optimization. A lost event only delays work until the
//! receiving actor's own polling cycle, so broadcast failures are logged and
//! never returned to the caller.

mod coordinator;
mod events;
mod in_memory;
mod membership;
mod node;

pub use coordinator::{ClusterCoordinator, NodeInfoListener};
pub use events::{ClusterEvent, ClusterEventKind, EventCategory, EventDispatcher, EventListener, ListenerId};
pub use in_memory::{InMemoryGroup, InMemoryMember};
pub use membership::{
    BroadcastError, EventSink, GroupMembership, MembershipCallback, StandaloneMembership,
};
pub use node::{ClusterNodeInfo, NodeAddress, sort_members};

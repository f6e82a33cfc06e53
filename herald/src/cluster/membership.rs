//! The group-membership transport seam.

use std::sync::Arc;

use thiserror::Error;

use super::events::ClusterEvent;
use super::node::NodeAddress;

/// Callback invoked after the member set changed.
pub type MembershipCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback receiving events broadcast by other nodes.
pub type EventSink = Arc<dyn Fn(ClusterEvent) + Send + Sync>;

/// Broadcast failure. Logged by the coordinator, never surfaced to callers.
#[derive(Debug, Clone, Error)]
pub enum BroadcastError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Delivery failed for {failed} of {attempted} nodes")]
    Partial { failed: usize, attempted: usize },
}

/// Group membership and broadcast facility.
pub trait GroupMembership: Send + Sync {
    /// Address of this node.
    fn local_node(&self) -> NodeAddress;

    /// Current members, in no particular order. May omit the local node.
    fn members(&self) -> Vec<NodeAddress>;

    /// Whether the facility designates this node as coordinator.
    fn is_coordinator(&self) -> bool;

    /// Register a callback for member-set changes.
    fn on_membership_changed(&self, callback: MembershipCallback);

    /// Register the sink for events arriving from other nodes.
    fn on_event(&self, sink: EventSink);

    /// Send `event` to every member except those in `excluded`.
    fn broadcast(
        &self,
        event: &ClusterEvent,
        excluded: &[NodeAddress],
    ) -> std::result::Result<(), BroadcastError>;
}

/// A cluster of one. Always the coordinator; broadcast goes nowhere.
#[derive(Debug, Clone)]
pub struct StandaloneMembership {
    local: NodeAddress,
}

impl StandaloneMembership {
    pub fn new(local: NodeAddress) -> Self {
        Self { local }
    }
}

impl Default for StandaloneMembership {
    fn default() -> Self {
        Self::new(NodeAddress::new(
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            0,
        ))
    }
}

impl GroupMembership for StandaloneMembership {
    fn local_node(&self) -> NodeAddress {
        self.local
    }

    fn members(&self) -> Vec<NodeAddress> {
        vec![self.local]
    }

    fn is_coordinator(&self) -> bool {
        true
    }

    fn on_membership_changed(&self, _callback: MembershipCallback) {}

    fn on_event(&self, _sink: EventSink) {}

    fn broadcast(
        &self,
        _event: &ClusterEvent,
        _excluded: &[NodeAddress],
    ) -> std::result::Result<(), BroadcastError> {
        Ok(())
    }
}

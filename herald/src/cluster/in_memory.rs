//! In-process group membership.
//!
//! `InMemoryGroup` simulates a cluster inside one process. Each joined node
//! gets an `InMemoryMember` implementing `GroupMembership`; broadcasts are
//! delivered synchronously on the caller's thread. The coordinator is the
//! longest-standing member (first in join order).

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::events::ClusterEvent;
use super::membership::{BroadcastError, EventSink, GroupMembership, MembershipCallback};
use super::node::NodeAddress;

#[derive(Default)]
struct MemberSlot {
    address: Option<NodeAddress>,
    reachable: bool,
    callbacks: Vec<MembershipCallback>,
    sinks: Vec<EventSink>,
}

#[derive(Default)]
struct GroupState {
    /// Join order.
    members: Vec<MemberSlot>,
}

impl GroupState {
    fn slot(&self, address: NodeAddress) -> Option<&MemberSlot> {
        self.members
            .iter()
            .find(|slot| slot.address == Some(address))
    }

    fn slot_mut(&mut self, address: NodeAddress) -> Option<&mut MemberSlot> {
        self.members
            .iter_mut()
            .find(|slot| slot.address == Some(address))
    }

    fn all_callbacks(&self) -> Vec<MembershipCallback> {
        self.members
            .iter()
            .flat_map(|slot| slot.callbacks.iter().cloned())
            .collect()
    }
}

/// An in-process membership and broadcast hub.
#[derive(Clone, Default)]
pub struct InMemoryGroup {
    state: Arc<Mutex<GroupState>>,
}

impl InMemoryGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the group and notify every member's callbacks.
    ///
    /// Joining an address that is already a member returns a handle to the
    /// existing membership without notifying.
    pub fn join(&self, address: NodeAddress) -> Arc<InMemoryMember> {
        let callbacks = {
            let mut state = self.state.lock();
            if state.slot(address).is_some() {
                None
            } else {
                state.members.push(MemberSlot {
                    address: Some(address),
                    reachable: true,
                    ..Default::default()
                });
                Some(state.all_callbacks())
            }
        };

        if let Some(callbacks) = callbacks {
            info!(node = %address, "Node joined group");
            notify(&callbacks);
        }

        Arc::new(InMemoryMember {
            group: self.clone(),
            address,
        })
    }

    /// Remove a node from the group and notify the remaining members.
    pub fn leave(&self, address: NodeAddress) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            let before = state.members.len();
            state.members.retain(|slot| slot.address != Some(address));
            if state.members.len() == before {
                return false;
            }
            state.all_callbacks()
        };

        info!(node = %address, "Node left group");
        notify(&callbacks);
        true
    }

    /// Toggle event delivery to a node. Membership is unchanged.
    pub fn set_reachable(&self, address: NodeAddress, reachable: bool) {
        if let Some(slot) = self.state.lock().slot_mut(address) {
            slot.reachable = reachable;
        }
    }

    /// Current members in join order.
    pub fn members(&self) -> Vec<NodeAddress> {
        self.state
            .lock()
            .members
            .iter()
            .filter_map(|slot| slot.address)
            .collect()
    }

    pub fn coordinator(&self) -> Option<NodeAddress> {
        self.state
            .lock()
            .members
            .first()
            .and_then(|slot| slot.address)
    }
}

impl std::fmt::Debug for InMemoryGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryGroup")
            .field("members", &self.members())
            .finish()
    }
}

fn notify(callbacks: &[MembershipCallback]) {
    for callback in callbacks {
        callback();
    }
}

/// One node's view of an `InMemoryGroup`.
#[derive(Debug)]
pub struct InMemoryMember {
    group: InMemoryGroup,
    address: NodeAddress,
}

impl InMemoryMember {
    pub fn group(&self) -> &InMemoryGroup {
        &self.group
    }
}

impl GroupMembership for InMemoryMember {
    fn local_node(&self) -> NodeAddress {
        self.address
    }

    fn members(&self) -> Vec<NodeAddress> {
        self.group.members()
    }

    fn is_coordinator(&self) -> bool {
        self.group.coordinator() == Some(self.address)
    }

    fn on_membership_changed(&self, callback: MembershipCallback) {
        if let Some(slot) = self.group.state.lock().slot_mut(self.address) {
            slot.callbacks.push(callback);
        }
    }

    fn on_event(&self, sink: EventSink) {
        if let Some(slot) = self.group.state.lock().slot_mut(self.address) {
            slot.sinks.push(sink);
        }
    }

    fn broadcast(
        &self,
        event: &ClusterEvent,
        excluded: &[NodeAddress],
    ) -> std::result::Result<(), BroadcastError> {
        let (targets, attempted, failed) = {
            let state = self.group.state.lock();
            let mut targets = Vec::new();
            let mut attempted = 0;
            let mut failed = 0;
            for slot in &state.members {
                let Some(address) = slot.address else {
                    continue;
                };
                if excluded.contains(&address) {
                    continue;
                }
                attempted += 1;
                if !slot.reachable {
                    failed += 1;
                    continue;
                }
                targets.extend(slot.sinks.iter().cloned());
            }
            (targets, attempted, failed)
        };

        debug!(
            from = %self.address,
            event = %event.description(),
            attempted,
            failed,
            "Broadcasting cluster event"
        );

        for sink in targets {
            sink(event.clone());
        }

        if failed > 0 {
            return Err(BroadcastError::Partial { failed, attempted });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::Value;

    use super::*;

    fn addr(last: u8) -> NodeAddress {
        NodeAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 7000)
    }

    #[test]
    fn test_coordinator_is_first_joined() {
        let group = InMemoryGroup::new();
        let b = group.join(addr(2));
        let a = group.join(addr(1));

        assert!(b.is_coordinator());
        assert!(!a.is_coordinator());

        group.leave(addr(2));
        assert!(a.is_coordinator());
    }

    #[test]
    fn test_membership_callbacks() {
        let group = InMemoryGroup::new();
        let a = group.join(addr(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        a.on_membership_changed(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        group.join(addr(2));
        group.join(addr(2));
        group.leave(addr(2));
        assert!(!group.leave(addr(2)));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_broadcast_respects_exclusions() {
        let group = InMemoryGroup::new();
        let a = group.join(addr(1));
        let b = group.join(addr(2));

        let received_a = Arc::new(AtomicUsize::new(0));
        let received_b = Arc::new(AtomicUsize::new(0));
        let counter = received_a.clone();
        a.on_event(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = received_b.clone();
        b.on_event(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let event = ClusterEvent::custom("ping", Value::Null);
        a.broadcast(&event, &[a.local_node()]).unwrap();

        assert_eq!(received_a.load(Ordering::SeqCst), 0);
        assert_eq!(received_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unreachable_member_reports_partial_failure() {
        let group = InMemoryGroup::new();
        let a = group.join(addr(1));
        let _b = group.join(addr(2));
        let _c = group.join(addr(3));
        group.set_reachable(addr(3), false);

        let err = a
            .broadcast(&ClusterEvent::custom("ping", Value::Null), &[a.local_node()])
            .unwrap_err();
        assert!(matches!(
            err,
            BroadcastError::Partial {
                failed: 1,
                attempted: 2
            }
        ));
    }
}

//! Cluster view publication and event fan-out.

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, RwLock};
use tracing::{debug, error, info, warn};

use super::events::{ClusterEvent, EventCategory, EventDispatcher, EventListener, ListenerId};
use super::membership::GroupMembership;
use super::node::{ClusterNodeInfo, NodeAddress};

/// Callback invoked with every newly published cluster view.
pub type NodeInfoListener = Arc<dyn Fn(&ClusterNodeInfo) + Send + Sync>;

/// Maintains this node's `ClusterNodeInfo` and routes cluster events.
///
/// The view is recomputed from scratch on every membership change and
/// published by swapping an `Arc`, so readers always see a complete view.
/// Listeners see views in increasing version order; a view superseded before
/// it could be delivered is skipped.
pub struct ClusterCoordinator {
    membership: Arc<dyn GroupMembership>,
    node_info: RwLock<Arc<ClusterNodeInfo>>,
    listeners: RwLock<Vec<NodeInfoListener>>,
    /// Highest version handed to listeners.
    delivered: ReentrantMutex<Cell<u64>>,
    dispatcher: EventDispatcher,
}

impl ClusterCoordinator {
    /// Compute the initial view and hook into the membership facility.
    pub fn start(membership: Arc<dyn GroupMembership>) -> Arc<Self> {
        let local = membership.local_node();
        let coordinator = Arc::new(Self {
            membership: membership.clone(),
            node_info: RwLock::new(Arc::new(ClusterNodeInfo::initial(local))),
            listeners: RwLock::new(Vec::new()),
            delivered: ReentrantMutex::new(Cell::new(0)),
            dispatcher: EventDispatcher::new(),
        });

        coordinator.membership_changed();

        let weak: Weak<Self> = Arc::downgrade(&coordinator);
        membership.on_membership_changed(Arc::new(move || {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.membership_changed();
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(&coordinator);
        membership.on_event(Arc::new(move |event| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.dispatcher.dispatch(&event);
            }
        }));

        let info = coordinator.node_info();
        info!(
            node = %local,
            position = info.position,
            size = info.size,
            is_coordinator = info.is_coordinator,
            "Cluster coordinator started"
        );

        coordinator
    }

    /// Current published view.
    pub fn node_info(&self) -> Arc<ClusterNodeInfo> {
        self.node_info.read().clone()
    }

    pub fn is_coordinator(&self) -> bool {
        self.node_info.read().is_coordinator
    }

    pub fn local_node(&self) -> NodeAddress {
        self.membership.local_node()
    }

    /// Register a view listener. It is invoked immediately with the current view.
    pub fn add_node_info_listener(&self, listener: NodeInfoListener) {
        let _delivery = self.delivered.lock();
        self.listeners.write().push(listener.clone());
        let current = self.node_info();
        invoke_listener(&listener, &current);
    }

    /// Recompute and publish the view after a membership change.
    ///
    /// The publish is a compare-and-set against the view read at the start of
    /// the computation. When a concurrent publish wins, the computation is
    /// redone against the newer view.
    pub fn membership_changed(&self) {
        let local = self.membership.local_node();

        let published = loop {
            let previous = self.node_info();
            let next = Arc::new(ClusterNodeInfo::compute(
                local,
                self.membership.members(),
                self.membership.is_coordinator(),
                previous.cluster_version + 1,
            ));

            let mut current = self.node_info.write();
            if Arc::ptr_eq(&current, &previous) {
                *current = next.clone();
                break next;
            }
            debug!(
                node = %local,
                superseded_version = next.cluster_version,
                "Concurrent cluster view publish, recomputing"
            );
        };

        debug!(
            node = %local,
            version = published.cluster_version,
            position = published.position,
            size = published.size,
            is_coordinator = published.is_coordinator,
            "Published cluster view"
        );

        self.deliver(&published);
    }

    fn deliver(&self, published: &Arc<ClusterNodeInfo>) {
        let delivered = self.delivered.lock();
        let version = published.cluster_version;
        if version <= delivered.get() || self.node_info().cluster_version > version {
            debug!(
                node = %self.membership.local_node(),
                version,
                delivered = delivered.get(),
                "Skipping superseded cluster view"
            );
            return;
        }
        delivered.set(version);

        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            invoke_listener(listener, published);
        }
    }

    pub fn subscribe(&self, category: EventCategory, listener: EventListener) -> ListenerId {
        self.dispatcher.subscribe(category, listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    /// Deliver `event` to local listeners and to every other node.
    pub fn fire_event(&self, event: ClusterEvent) {
        let event = event.with_origin(self.local_node());
        self.dispatcher.dispatch(&event);
        self.broadcast(&event);
    }

    /// Deliver `event` to every other node only.
    pub fn fire_event_exclude_self(&self, event: ClusterEvent) {
        let event = event.with_origin(self.local_node());
        self.broadcast(&event);
    }

    fn broadcast(&self, event: &ClusterEvent) {
        let local = self.local_node();
        if let Err(e) = self.membership.broadcast(event, &[local]) {
            warn!(
                node = %local,
                event = %event.description(),
                error = %e,
                "Cluster broadcast failed"
            );
        }
    }
}

fn invoke_listener(listener: &NodeInfoListener, info: &ClusterNodeInfo) {
    if catch_unwind(AssertUnwindSafe(|| listener(info))).is_err() {
        error!(
            version = info.cluster_version,
            "Cluster view listener panicked"
        );
    }
}

impl std::fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("local_node", &self.local_node())
            .field("node_info", &self.node_info())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::Value;

    use super::*;
    use crate::cluster::{InMemoryGroup, StandaloneMembership};

    fn addr(last: u8) -> NodeAddress {
        NodeAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 7000)
    }

    #[test]
    fn test_standalone_view() {
        let coordinator = ClusterCoordinator::start(Arc::new(StandaloneMembership::default()));
        let info = coordinator.node_info();
        assert!(info.is_coordinator);
        assert_eq!(info.position, 0);
        assert_eq!(info.size, 1);
        assert_eq!(info.cluster_version, 1);
    }

    #[test]
    fn test_view_follows_membership() {
        let group = InMemoryGroup::new();
        let c = ClusterCoordinator::start(group.join(addr(3)));
        let a = ClusterCoordinator::start(group.join(addr(1)));

        assert!(c.is_coordinator());
        assert!(!a.is_coordinator());
        assert_eq!(c.node_info().position, 1);
        assert_eq!(a.node_info().position, 0);
        assert_eq!(c.node_info().size, 2);

        let before = c.node_info().cluster_version;
        group.leave(addr(1));
        let after = c.node_info();
        assert_eq!(after.cluster_version, before + 1);
        assert_eq!(after.position, 0);
        assert_eq!(after.size, 1);
    }

    #[test]
    fn test_listener_invoked_immediately_and_on_change() {
        let group = InMemoryGroup::new();
        let coordinator = ClusterCoordinator::start(group.join(addr(1)));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        coordinator.add_node_info_listener(Arc::new(move |info: &ClusterNodeInfo| {
            sink.lock().push(info.size);
        }));
        group.join(addr(2));

        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_concurrent_publishes_reach_listeners_in_order() {
        let group = InMemoryGroup::new();
        let coordinator = ClusterCoordinator::start(group.join(addr(1)));
        let versions = Arc::new(Mutex::new(Vec::new()));

        let sink = versions.clone();
        coordinator.add_node_info_listener(Arc::new(move |info: &ClusterNodeInfo| {
            sink.lock().push(info.cluster_version);
        }));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        coordinator.membership_changed();
                    }
                });
            }
        });

        let versions = versions.lock().clone();
        assert!(versions.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", versions);
        assert_eq!(versions.last().copied(), Some(coordinator.node_info().cluster_version));
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let coordinator = ClusterCoordinator::start(Arc::new(StandaloneMembership::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        coordinator
            .add_node_info_listener(Arc::new(|_: &ClusterNodeInfo| panic!("bad listener")));
        let counter = calls.clone();
        coordinator.add_node_info_listener(Arc::new(move |_: &ClusterNodeInfo| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        coordinator.membership_changed();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fire_event_reaches_local_and_remote() {
        let group = InMemoryGroup::new();
        let a = ClusterCoordinator::start(group.join(addr(1)));
        let b = ClusterCoordinator::start(group.join(addr(2)));

        let on_a = Arc::new(AtomicUsize::new(0));
        let on_b = Arc::new(AtomicUsize::new(0));
        let counter = on_a.clone();
        a.subscribe(
            EventCategory::Custom,
            Arc::new(move |_: &ClusterEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = on_b.clone();
        b.subscribe(
            EventCategory::Custom,
            Arc::new(move |event: &ClusterEvent| {
                assert_eq!(event.origin, Some(addr(1)));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        a.fire_event(ClusterEvent::custom("hello", Value::Null));
        assert_eq!(on_a.load(Ordering::SeqCst), 1);
        assert_eq!(on_b.load(Ordering::SeqCst), 1);

        a.fire_event_exclude_self(ClusterEvent::custom("hello", Value::Null));
        assert_eq!(on_a.load(Ordering::SeqCst), 1);
        assert_eq!(on_b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_broadcast_failure_is_swallowed() {
        let group = InMemoryGroup::new();
        let a = ClusterCoordinator::start(group.join(addr(1)));
        let _b = ClusterCoordinator::start(group.join(addr(2)));
        group.set_reachable(addr(2), false);

        a.fire_event(ClusterEvent::custom("lost", Value::Null));
    }
}

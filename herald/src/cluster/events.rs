//! Cluster events and category-indexed dispatch.
//!
//! Every event carries an explicit list of categories, fixed when the event is
//! constructed. Listeners subscribe to a category; dispatch looks each of the
//! event's categories up in a map and invokes that category's listeners. A
//! listener subscribed to `EventCategory::Any` sees every event.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, trace};

use super::node::NodeAddress;

/// Category tags used to route events to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Every event.
    Any,
    /// Anything that affects when work runs.
    Scheduling,
    /// Request to re-run a named actor.
    ActorReschedule,
    /// Anything about backlog contents.
    Backlog,
    /// New or changed work in a backlog partition.
    BacklogChanged,
    /// Application-defined events.
    Custom,
}

/// Payload of a cluster event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEventKind {
    /// Re-evaluate the named actor after `delay_ms`.
    RescheduleActor { actor_name: String, delay_ms: i64 },
    /// Work keyed by `partition_key` is due at `next_schedule_time`.
    BacklogChanged {
        partition_key: String,
        next_schedule_time: i64,
    },
    /// Application-defined event.
    Custom { topic: String, payload: Value },
}

/// An event broadcast between cluster nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub kind: ClusterEventKind,
    categories: Vec<EventCategory>,
    /// Node that fired the event, set when it is fired.
    pub origin: Option<NodeAddress>,
}

impl ClusterEvent {
    fn with_categories(kind: ClusterEventKind, categories: &[EventCategory]) -> Self {
        let mut event = Self {
            kind,
            categories: Vec::with_capacity(categories.len()),
            origin: None,
        };
        for category in categories {
            event = event.with_category(*category);
        }
        event
    }

    pub fn reschedule_actor(actor_name: impl Into<String>, delay_ms: i64) -> Self {
        Self::with_categories(
            ClusterEventKind::RescheduleActor {
                actor_name: actor_name.into(),
                delay_ms,
            },
            &[
                EventCategory::ActorReschedule,
                EventCategory::Scheduling,
                EventCategory::Any,
            ],
        )
    }

    pub fn backlog_changed(partition_key: impl Into<String>, next_schedule_time: i64) -> Self {
        Self::with_categories(
            ClusterEventKind::BacklogChanged {
                partition_key: partition_key.into(),
                next_schedule_time,
            },
            &[
                EventCategory::BacklogChanged,
                EventCategory::Backlog,
                EventCategory::Scheduling,
                EventCategory::Any,
            ],
        )
    }

    pub fn custom(topic: impl Into<String>, payload: Value) -> Self {
        Self::with_categories(
            ClusterEventKind::Custom {
                topic: topic.into(),
                payload,
            },
            &[EventCategory::Custom, EventCategory::Any],
        )
    }

    /// Add a category tag. Tags already present are ignored.
    pub fn with_category(mut self, category: EventCategory) -> Self {
        if !self.categories.contains(&category) {
            self.categories.push(category);
        }
        self
    }

    pub fn with_origin(mut self, origin: NodeAddress) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn categories(&self) -> &[EventCategory] {
        &self.categories
    }

    pub fn has_category(&self, category: EventCategory) -> bool {
        self.categories.contains(&category)
    }

    /// Get a description of the event for logging.
    pub fn description(&self) -> String {
        match &self.kind {
            ClusterEventKind::RescheduleActor {
                actor_name,
                delay_ms,
            } => format!("Reschedule actor {} in {}ms", actor_name, delay_ms),
            ClusterEventKind::BacklogChanged {
                partition_key,
                next_schedule_time,
            } => format!(
                "Backlog {} has work due at {}",
                partition_key, next_schedule_time
            ),
            ClusterEventKind::Custom { topic, .. } => format!("Custom event: {}", topic),
        }
    }
}

/// Callback invoked for a dispatched event.
pub type EventListener = Arc<dyn Fn(&ClusterEvent) + Send + Sync>;

/// Identifies a subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Category-indexed listener table.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<HashMap<EventCategory, Vec<(ListenerId, EventListener)>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, category: EventCategory, listener: EventListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(category)
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove a subscription. Returns `false` if it was not found.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let mut removed = false;
        for entries in listeners.values_mut() {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            removed |= entries.len() != before;
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().values().map(Vec::len).sum()
    }

    /// Invoke the listeners of each of the event's categories.
    ///
    /// Listeners run on the calling thread, in subscription order within a
    /// category. A panicking listener is logged and skipped. Returns the
    /// number of listener invocations.
    pub fn dispatch(&self, event: &ClusterEvent) -> usize {
        let targets: Vec<EventListener> = {
            let listeners = self.listeners.read();
            event
                .categories()
                .iter()
                .filter_map(|category| listeners.get(category))
                .flat_map(|entries| entries.iter().map(|(_, listener)| listener.clone()))
                .collect()
        };

        trace!(event = %event.description(), listeners = targets.len(), "Dispatching cluster event");

        for listener in &targets {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(event = %event.description(), "Cluster event listener panicked");
            }
        }

        targets.len()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    use super::*;

    fn counter_listener(counter: &Arc<AtomicUsize>) -> EventListener {
        let counter = counter.clone();
        Arc::new(move |_: &ClusterEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_categories_are_deduplicated() {
        let event = ClusterEvent::reschedule_actor("a", 0)
            .with_category(EventCategory::Scheduling)
            .with_category(EventCategory::Any);
        assert_eq!(
            event.categories(),
            &[
                EventCategory::ActorReschedule,
                EventCategory::Scheduling,
                EventCategory::Any
            ]
        );
    }

    #[test]
    fn test_dispatch_by_category() {
        let dispatcher = EventDispatcher::new();
        let reschedules = Arc::new(AtomicUsize::new(0));
        let backlog = Arc::new(AtomicUsize::new(0));
        let any = Arc::new(AtomicUsize::new(0));

        dispatcher.subscribe(EventCategory::ActorReschedule, counter_listener(&reschedules));
        dispatcher.subscribe(EventCategory::Backlog, counter_listener(&backlog));
        dispatcher.subscribe(EventCategory::Any, counter_listener(&any));

        dispatcher.dispatch(&ClusterEvent::reschedule_actor("a", 0));
        dispatcher.dispatch(&ClusterEvent::backlog_changed("email", 10));
        dispatcher.dispatch(&ClusterEvent::custom("ping", Value::Null));

        assert_eq!(reschedules.load(Ordering::SeqCst), 1);
        assert_eq!(backlog.load(Ordering::SeqCst), 1);
        assert_eq!(any.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_ancestor_category_listener_fires_once_per_event() {
        let dispatcher = EventDispatcher::new();
        let scheduling = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe(EventCategory::Scheduling, counter_listener(&scheduling));

        let event = ClusterEvent::backlog_changed("sms", 5).with_category(EventCategory::Scheduling);
        assert_eq!(dispatcher.dispatch(&event), 1);
        assert_eq!(scheduling.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_order_and_panic_isolation() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        dispatcher.subscribe(
            EventCategory::Custom,
            Arc::new(move |_: &ClusterEvent| first.lock().push(1)),
        );
        dispatcher.subscribe(
            EventCategory::Custom,
            Arc::new(|_: &ClusterEvent| panic!("listener bug")),
        );
        let third = seen.clone();
        dispatcher.subscribe(
            EventCategory::Custom,
            Arc::new(move |_: &ClusterEvent| third.lock().push(3)),
        );

        assert_eq!(dispatcher.dispatch(&ClusterEvent::custom("t", Value::Null)), 3);
        assert_eq!(*seen.lock(), vec![1, 3]);
    }

    #[test]
    fn test_unsubscribe() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = dispatcher.subscribe(EventCategory::Any, counter_listener(&counter));

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        dispatcher.dispatch(&ClusterEvent::custom("t", Value::Null));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[test]
    fn test_event_serde() {
        let event = ClusterEvent::reschedule_actor("digest", 250);
        let json = serde_json::to_string(&event).unwrap();
        let back: ClusterEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(json.contains("\"reschedule_actor\""));
    }
}

//! Backlog-draining actor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::{ProcessOutcome, WakeTarget, WorkProcessor};
use crate::actor::{Actor, ActorManager, ActorOutcome, ActorResult};
use crate::backlog::{BacklogStore, PartitionKey, WorkItem, WorkItemState};
use crate::clock::{SharedClock, delay_until, duration_to_ms};
use crate::cluster::{ClusterCoordinator, ClusterEvent, ClusterEventKind, EventCategory, ListenerId};

/// Tuning for a backlog actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogActorOptions {
    /// Most items processed per run.
    pub batch_limit: usize,
    /// Longest sleep between runs.
    pub idle_poll_interval: Duration,
    /// How far a deferred item's schedule time moves.
    pub defer_delay: Duration,
}

impl Default for BacklogActorOptions {
    fn default() -> Self {
        Self {
            batch_limit: 100,
            idle_poll_interval: Duration::from_secs(60),
            defer_delay: Duration::from_secs(5),
        }
    }
}

/// Processes the due items of one partition key on this node.
pub struct BacklogActor {
    store: Arc<dyn BacklogStore>,
    processor: Arc<dyn WorkProcessor>,
    key: Arc<dyn PartitionKey>,
    clock: SharedClock,
    coordinator: Option<Arc<ClusterCoordinator>>,
    options: BacklogActorOptions,
    wake_target: Arc<WakeTarget>,
}

impl BacklogActor {
    pub fn new(
        store: Arc<dyn BacklogStore>,
        processor: Arc<dyn WorkProcessor>,
        key: Arc<dyn PartitionKey>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            processor,
            key,
            clock,
            coordinator: None,
            options: BacklogActorOptions::default(),
            wake_target: Arc::new(WakeTarget::new()),
        }
    }

    /// Take this node's partition from the coordinator's cluster view.
    pub fn with_coordinator(mut self, coordinator: Arc<ClusterCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_options(mut self, options: BacklogActorOptions) -> Self {
        self.options = options;
        self
    }

    /// Shared with writers so they know when this actor next runs.
    pub fn wake_target(&self) -> Arc<WakeTarget> {
        self.wake_target.clone()
    }

    pub fn key(&self) -> &Arc<dyn PartitionKey> {
        &self.key
    }

    /// `(partition, partition_count)` for this node.
    pub fn partition(&self) -> (usize, usize) {
        match &self.coordinator {
            Some(coordinator) => {
                let info = coordinator.node_info();
                (info.position, info.size)
            }
            None => (0, 1),
        }
    }

    /// Wake this actor, registered as `actor_name` in `manager`, when
    /// another node reports new work for its partition key.
    ///
    /// Returns `None` without a coordinator. The subscription lives until
    /// it is removed with `ClusterCoordinator::unsubscribe`.
    pub fn route_wakeups(&self, manager: &ActorManager, actor_name: &str) -> Option<ListenerId> {
        let coordinator = self.coordinator.as_ref()?;
        let key_name = self.key.name();
        let actor_name = actor_name.to_string();
        let manager = manager.downgrade();
        let wake_target = self.wake_target.clone();
        let clock = self.clock.clone();

        let id = coordinator.subscribe(
            EventCategory::BacklogChanged,
            Arc::new(move |event: &ClusterEvent| {
                let ClusterEventKind::BacklogChanged {
                    partition_key,
                    next_schedule_time,
                } = &event.kind
                else {
                    return;
                };
                if *partition_key != key_name || !wake_target.request_wake(*next_schedule_time) {
                    return;
                }
                let Some(manager) = manager.upgrade() else {
                    return;
                };

                let delay_ms = duration_to_ms(delay_until(*next_schedule_time, clock.now_ms()));
                debug!(actor = %actor_name, key = %key_name, delay_ms, "Backlog changed on another node, waking actor");
                if let Err(e) = manager.wake_actor(&actor_name, delay_ms) {
                    warn!(actor = %actor_name, error = %e, "Failed to wake backlog actor");
                }
            }),
        );
        Some(id)
    }

    async fn handle(&self, mut item: WorkItem) {
        let id = item.id;
        let outcome = self.processor.process(&item).await;

        let result = match outcome {
            ProcessOutcome::Completed => self.store.complete(id).await.map(|_| ()),
            ProcessOutcome::Deferred | ProcessOutcome::Failed(_) => {
                if let ProcessOutcome::Failed(reason) = &outcome {
                    warn!(item_id = id, reason = %reason, "Work item failed, deferring");
                }
                let retry_at = self.clock.now_ms() + duration_to_ms(self.options.defer_delay);
                item.schedule_time = Some(retry_at);
                self.store.defer(item).await.map(|stored| {
                    if stored.state == WorkItemState::Dropped {
                        warn!(item_id = id, defer_count = stored.defer_count, "Work item dropped");
                    }
                })
            }
        };

        if let Err(e) = result {
            warn!(item_id = id, error = %e, "Failed to record work item outcome");
        }
    }
}

#[async_trait]
impl Actor for BacklogActor {
    async fn run(&self) -> ActorResult {
        let (partition, partition_count) = self.partition();
        let key = self.key.as_ref();
        let batch_limit = self.options.batch_limit.max(1);
        self.wake_target.mark_unknown();

        self.store.expire_deadlines().await?;
        let due = self
            .store
            .get_due_items(partition, partition_count, Some(batch_limit), key)
            .await?;
        let batch_full = due.len() >= batch_limit;

        if !due.is_empty() {
            debug!(
                key = %key.name(),
                partition,
                partition_count,
                count = due.len(),
                "Processing due work items"
            );
        }

        for item in due {
            self.handle(item).await;
        }

        let now = self.clock.now_ms();
        let idle = self.options.idle_poll_interval;
        let delay = if batch_full {
            Duration::ZERO
        } else {
            match self
                .store
                .get_next_schedule_time(partition, partition_count, key)
                .await?
            {
                Some(next) => delay_until(next, now).min(idle),
                None => idle,
            }
        };

        self.wake_target
            .set(now.saturating_add(duration_to_ms(delay)));
        trace!(key = %key.name(), ?delay, "Backlog actor sleeping");
        Ok(ActorOutcome::Reschedule(delay))
    }
}

//! Transactional producer for backlog items.

use std::sync::Arc;

use tracing::{debug, warn};

use super::WakeTarget;
use crate::actor::ActorManager;
use crate::backlog::{BacklogStore, PartitionKey, WorkItem};
use crate::clock::{SharedClock, delay_until, duration_to_ms};
use crate::cluster::{ClusterCoordinator, ClusterEvent};
use crate::transaction::{TransactionBoundary, register_post_commit_listener};
use crate::{Error, Result};

/// Adds work items and wakes the consuming actor when they are due early.
///
/// Items are written inside a transaction, joining the caller's when there
/// is one. After commit, if the earliest new item is due before the actor's
/// wake target, the actor is rescheduled for that time.
///
/// Without cluster routing the reschedule goes to the actor of the same name
/// on every node. With [`BacklogWriter::with_cluster`] the local actor is
/// woken directly and other nodes get a `BacklogChanged` event for the
/// partition key, which each node's [`BacklogActor::route_wakeups`] checks
/// against its own wake target.
///
/// [`BacklogActor::route_wakeups`]: super::BacklogActor::route_wakeups
#[derive(Clone)]
pub struct BacklogWriter {
    store: Arc<dyn BacklogStore>,
    manager: ActorManager,
    actor_name: String,
    wake_target: Arc<WakeTarget>,
    clock: SharedClock,
    boundary: TransactionBoundary,
    route: Option<(Arc<ClusterCoordinator>, String)>,
}

impl BacklogWriter {
    pub fn new(
        store: Arc<dyn BacklogStore>,
        manager: ActorManager,
        actor_name: impl Into<String>,
        wake_target: Arc<WakeTarget>,
        clock: SharedClock,
        boundary: TransactionBoundary,
    ) -> Self {
        Self {
            store,
            manager,
            actor_name: actor_name.into(),
            wake_target,
            clock,
            boundary,
            route: None,
        }
    }

    /// Announce new work for `key` to other nodes through `coordinator`.
    pub fn with_cluster(mut self, coordinator: Arc<ClusterCoordinator>, key: &dyn PartitionKey) -> Self {
        self.route = Some((coordinator, key.name()));
        self
    }

    /// Add one item.
    pub async fn submit(&self, item: WorkItem) -> Result<WorkItem> {
        let mut stored = self.submit_all(vec![item]).await?;
        stored
            .pop()
            .ok_or_else(|| Error::Other("submitted item missing".to_string()))
    }

    /// Add several items in one transaction.
    pub async fn submit_all(&self, items: Vec<WorkItem>) -> Result<Vec<WorkItem>> {
        let store = self.store.clone();
        let writer = self.clone();

        self.boundary
            .run(true, move || async move {
                let mut stored = Vec::with_capacity(items.len());
                for item in items {
                    stored.push(store.add(item).await?);
                }

                if let Some(earliest) = stored.iter().filter_map(|i| i.schedule_time).min() {
                    register_post_commit_listener(move || writer.nudge(earliest))?;
                }
                Ok::<_, Error>(stored)
            })
            .await
    }

    fn nudge(&self, due: i64) {
        if self.wake_target.request_wake(due) {
            let delay_ms = duration_to_ms(delay_until(due, self.clock.now_ms()));
            debug!(actor = %self.actor_name, delay_ms, "New work due early, waking actor");
            let woken = match &self.route {
                Some(_) => self.manager.wake_actor(&self.actor_name, delay_ms),
                None => self.manager.reschedule_actor(&self.actor_name, delay_ms),
            };
            if let Err(e) = woken {
                warn!(actor = %self.actor_name, error = %e, "Failed to wake backlog actor");
            }
        }

        // Other nodes keep their own wake targets, so they always hear about it.
        if let Some((coordinator, key_name)) = &self.route {
            coordinator.fire_event_exclude_self(ClusterEvent::backlog_changed(key_name.clone(), due));
        }
    }
}

impl std::fmt::Debug for BacklogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BacklogWriter")
            .field("actor_name", &self.actor_name)
            .field("wake_target", &self.wake_target.get())
            .field("partition_key", &self.route.as_ref().map(|(_, key)| key))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::actor::{ActorManagerConfig, ActorOutcome, actor_fn};
    use crate::backlog::InMemoryBacklog;
    use crate::clock::system_clock;
    use crate::scheduler::TokioScheduler;
    use crate::transaction::run_in_transaction;

    fn writer(
        counter: &Arc<AtomicUsize>,
    ) -> (BacklogWriter, Arc<InMemoryBacklog>, Arc<WakeTarget>) {
        let clock = system_clock();
        let backlog = Arc::new(InMemoryBacklog::new(clock.clone()));
        let manager = ActorManager::new(
            Arc::new(TokioScheduler::new("test").unwrap()),
            ActorManagerConfig::default(),
        );

        let runs = counter.clone();
        manager
            .register_suspended_actor(
                "consumer",
                actor_fn(move || {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(ActorOutcome::Suspended)
                    }
                }),
            )
            .unwrap();

        let wake_target = Arc::new(WakeTarget::new());
        let writer = BacklogWriter::new(
            backlog.clone(),
            manager,
            "consumer",
            wake_target.clone(),
            clock,
            TransactionBoundary::new(Duration::from_secs(5)),
        );
        (writer, backlog, wake_target)
    }

    #[tokio::test]
    async fn test_submit_wakes_actor_after_commit() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (writer, backlog, wake_target) = writer(&runs);

        let stored = writer
            .submit(WorkItem::notification("email", json!({})))
            .await
            .unwrap();
        assert_eq!(backlog.get(stored.id).await.unwrap().id, stored.id);
        assert_eq!(wake_target.get(), stored.schedule_time.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_wake_when_actor_already_due_earlier() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (writer, _, wake_target) = writer(&runs);
        wake_target.set(0);

        writer
            .submit(WorkItem::notification("email", json!({})))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rolled_back_submit_neither_stores_nor_wakes() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (writer, backlog, wake_target) = writer(&runs);

        let result: Result<()> = run_in_transaction(Duration::from_secs(5), false, || async move {
            writer
                .submit(WorkItem::notification("email", json!({})))
                .await?;
            Err(Error::Other("caller failed".to_string()))
        })
        .await;

        assert!(result.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backlog.len().await.unwrap(), 0);
        assert_eq!(wake_target.get(), WakeTarget::NONE);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}

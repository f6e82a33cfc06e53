//! In-memory backlog store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use super::item::{DEFAULT_MAX_DEFER_COUNT, TriggerBearing, WorkItem, WorkItemState};
use super::partition::{PartitionKey, partition_matches};
use super::store::{BacklogStore, Completion};
use crate::clock::SharedClock;
use crate::schedule::{ScheduleCache, ScheduleContext, is_exhausted};
use crate::transaction::{in_transaction, stage_or_apply};
use crate::{Error, Result};

/// Backlog held in a concurrent map.
///
/// Reads see committed items only. Inside a transaction every write is
/// staged and applied on commit. Writes to existing items are checked
/// against the stored state again when applied, so a terminal item is never
/// overwritten; a staged write that loses that check is discarded.
#[derive(Debug)]
pub struct InMemoryBacklog {
    items: Arc<DashMap<u64, WorkItem>>,
    next_id: AtomicU64,
    clock: SharedClock,
    schedules: ScheduleCache,
    default_max_defer_count: u32,
}

impl InMemoryBacklog {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            items: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            schedules: ScheduleCache::new(clock.clone()),
            clock,
            default_max_defer_count: DEFAULT_MAX_DEFER_COUNT,
        }
    }

    /// Max defer count for items added without one.
    pub fn with_default_max_defer_count(mut self, max_defer_count: u32) -> Self {
        self.default_max_defer_count = max_defer_count;
        self
    }

    pub fn schedules(&self) -> &ScheduleCache {
        &self.schedules
    }

    fn stored(&self, id: u64) -> Result<WorkItem> {
        self.items
            .get(&id)
            .map(|item| item.value().clone())
            .ok_or_else(|| Error::not_found("WorkItem", id.to_string()))
    }

    fn insert_new(&self, item: WorkItem) {
        let items = self.items.clone();
        stage_or_apply(move || {
            items.insert(item.id, item);
        });
    }

    /// Replace an existing item, plus insert the successor of a completed job.
    ///
    /// Outside a transaction a lost state check is returned to the caller.
    fn replace(&self, item: WorkItem, successor: Option<WorkItem>) -> Result<()> {
        if !in_transaction() {
            return replace_checked(&self.items, item, successor);
        }

        let items = self.items.clone();
        stage_or_apply(move || {
            let id = item.id;
            if let Err(e) = replace_checked(&items, item, successor) {
                warn!(item_id = id, error = %e, "Discarding staged work item write");
            }
        });
        Ok(())
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn in_partition(
        item: &WorkItem,
        partition: usize,
        partition_count: usize,
        key: &dyn PartitionKey,
    ) -> bool {
        partition_matches(item.id, partition, partition_count) && key.matches(item)
    }

    /// Next occurrence of a recurring job completed at `now`.
    fn next_occurrence(&self, done: &WorkItem, now: i64) -> Result<Option<WorkItem>> {
        let Some(trigger) = done.trigger() else {
            return Ok(None);
        };
        let schedule = self.schedules.resolve(trigger)?;
        let ctx: ScheduleContext = done.schedule_context(now);
        let next = schedule.next_epoch(&ctx);

        if is_exhausted(&ctx, next) {
            info!(item_id = done.id, "Job schedule exhausted, not rescheduling");
            return Ok(None);
        }

        Ok(Some(WorkItem {
            id: self.allocate_id(),
            kind: done.kind.clone(),
            partition_key: done.partition_key.clone(),
            state: WorkItemState::New,
            schedule_time: Some(next),
            creation_time: now,
            last_execution_time: None,
            state_changed_at: now,
            defer_count: 0,
            max_defer_count: done.max_defer_count,
            deadline: None,
            schedule: done.schedule.clone(),
        }))
    }
}

#[async_trait]
impl BacklogStore for InMemoryBacklog {
    async fn add(&self, mut item: WorkItem) -> Result<WorkItem> {
        let now = self.clock.now_ms();

        if item.schedule_time.is_none() {
            let due = match item.effective_schedule() {
                Some(spec) => self.schedules.resolve(spec)?.next_epoch(&ScheduleContext::new()),
                None => now,
            };
            item.schedule_time = Some(due);
        }

        item.id = self.allocate_id();
        item.state = WorkItemState::New;
        item.creation_time = now;
        item.state_changed_at = now;
        item.max_defer_count.get_or_insert(self.default_max_defer_count);

        debug!(
            item_id = item.id,
            kind = item.kind_tag().as_str(),
            schedule_time = ?item.schedule_time,
            "Adding work item"
        );
        self.insert_new(item.clone());
        Ok(item)
    }

    async fn get(&self, id: u64) -> Result<WorkItem> {
        self.stored(id)
    }

    async fn get_due_items(
        &self,
        partition: usize,
        partition_count: usize,
        limit: Option<usize>,
        key: &dyn PartitionKey,
    ) -> Result<Vec<WorkItem>> {
        let now = self.clock.now_ms();
        let mut due: Vec<WorkItem> = self
            .items
            .iter()
            .filter(|entry| {
                let item = entry.value();
                item.is_due(now) && Self::in_partition(item, partition, partition_count, key)
            })
            .map(|entry| entry.value().clone())
            .collect();

        due.sort_by_key(|item| (item.schedule_time, item.id));
        if let Some(limit) = limit {
            due.truncate(limit);
        }
        Ok(due)
    }

    async fn get_next_schedule_time(
        &self,
        partition: usize,
        partition_count: usize,
        key: &dyn PartitionKey,
    ) -> Result<Option<i64>> {
        Ok(self
            .items
            .iter()
            .filter(|entry| {
                let item = entry.value();
                item.state == WorkItemState::New
                    && Self::in_partition(item, partition, partition_count, key)
            })
            .filter_map(|entry| entry.value().schedule_time)
            .min())
    }

    async fn update(&self, mut item: WorkItem) -> Result<WorkItem> {
        let stored = self.stored(item.id)?;

        let target = if item.state == WorkItemState::New && item.defer_limit_reached() {
            info!(
                item_id = item.id,
                defer_count = item.defer_count,
                "Work item deferred too often, dropping"
            );
            WorkItemState::Dropped
        } else {
            item.state
        };
        if stored.state.is_terminal() {
            return Err(Error::invalid_transition(stored.state, target));
        }

        item.state = target;
        item.creation_time = stored.creation_time;
        item.state_changed_at = if target == stored.state {
            stored.state_changed_at
        } else {
            self.clock.now_ms()
        };

        self.replace(item.clone(), None)?;
        Ok(item)
    }

    async fn complete(&self, id: u64) -> Result<Completion> {
        let mut item = self.stored(id)?;
        if item.state.is_terminal() {
            return Err(Error::invalid_transition(item.state, WorkItemState::Done));
        }

        let now = self.clock.now_ms();
        item.state = WorkItemState::Done;
        item.last_execution_time = Some(now);
        item.state_changed_at = now;

        let next = self.next_occurrence(&item, now)?;

        debug!(item_id = id, next = ?next.as_ref().map(|n| n.id), "Completed work item");
        self.replace(item.clone(), next.clone())?;

        Ok(Completion { item, next })
    }

    async fn expire_deadlines(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let expired: Vec<u64> = self
            .items
            .iter()
            .filter(|entry| entry.value().is_past_deadline(now))
            .map(|entry| *entry.key())
            .collect();

        if !expired.is_empty() {
            info!(count = expired.len(), "Work items reached their deadline");
        }

        for id in &expired {
            let items = self.items.clone();
            let id = *id;
            stage_or_apply(move || {
                if let Some(mut item) = items.get_mut(&id) {
                    if item.state == WorkItemState::New {
                        item.state = WorkItemState::DeadlineReached;
                        item.state_changed_at = now;
                    }
                }
            });
        }

        Ok(expired.len())
    }

    async fn purge_terminal(&self, older_than: i64) -> Result<usize> {
        let purgeable: Vec<u64> = self
            .items
            .iter()
            .filter(|entry| {
                let item = entry.value();
                item.state.is_terminal() && item.state_changed_at < older_than
            })
            .map(|entry| *entry.key())
            .collect();

        let items = self.items.clone();
        let ids = purgeable.clone();
        stage_or_apply(move || {
            for id in ids {
                items.remove_if(&id, |_, item| item.state.is_terminal());
            }
        });

        if !purgeable.is_empty() {
            debug!(count = purgeable.len(), "Purged terminal work items");
        }
        Ok(purgeable.len())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.items.len())
    }
}

/// Apply a write to a stored item under its shard lock.
///
/// Fails when the item is gone or already terminal. The successor is only
/// inserted when the write itself lands.
fn replace_checked(
    items: &DashMap<u64, WorkItem>,
    item: WorkItem,
    successor: Option<WorkItem>,
) -> Result<()> {
    match items.entry(item.id) {
        Entry::Occupied(mut current) => {
            let from = current.get().state;
            if from.is_terminal() {
                return Err(Error::invalid_transition(from, item.state));
            }
            from.transition_to(item.state)?;
            current.insert(item);
        }
        Entry::Vacant(_) => {
            return Err(Error::not_found("WorkItem", item.id.to_string()));
        }
    }

    if let Some(next) = successor {
        items.insert(next.id, next);
    }
    Ok(())
}

//! Backlog store trait.

use async_trait::async_trait;

use super::item::WorkItem;
use super::partition::PartitionKey;
use crate::Result;

/// Result of completing a work item.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// The item, now `Done`.
    pub item: WorkItem,
    /// Next occurrence of a recurring job, if any.
    pub next: Option<WorkItem>,
}

/// Storage for work items.
///
/// Inside a transaction, writes take effect when the transaction commits.
#[async_trait]
pub trait BacklogStore: Send + Sync {
    /// Store a new item at `New`, assigning its id and, when missing, its
    /// schedule time.
    async fn add(&self, item: WorkItem) -> Result<WorkItem>;

    async fn get(&self, id: u64) -> Result<WorkItem>;

    /// Due `New` items of one partition matching `key`, oldest due first.
    async fn get_due_items(
        &self,
        partition: usize,
        partition_count: usize,
        limit: Option<usize>,
        key: &dyn PartitionKey,
    ) -> Result<Vec<WorkItem>>;

    /// Earliest schedule time among `New` items of one partition matching `key`.
    async fn get_next_schedule_time(
        &self,
        partition: usize,
        partition_count: usize,
        key: &dyn PartitionKey,
    ) -> Result<Option<i64>>;

    /// Replace a stored item, applying the defer/drop policy.
    async fn update(&self, item: WorkItem) -> Result<WorkItem>;

    /// Mark an item `Done`. A recurring job yields its next occurrence.
    async fn complete(&self, id: u64) -> Result<Completion>;

    /// Count one more deferral and store the item.
    async fn defer(&self, mut item: WorkItem) -> Result<WorkItem> {
        item.defer_count = item.defer_count.saturating_add(1);
        self.update(item).await
    }

    /// Move `New` items whose deadline has passed to `DeadlineReached`.
    async fn expire_deadlines(&self) -> Result<usize>;

    /// Delete terminal items whose state changed before `older_than`.
    async fn purge_terminal(&self, older_than: i64) -> Result<usize>;

    async fn len(&self) -> Result<usize>;
}

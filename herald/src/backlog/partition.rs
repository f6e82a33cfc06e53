//! Partition keys and partition assignment.

use std::fmt;

use super::item::{WorkItem, WorkItemKind, WorkItemKindTag};

/// Selects a slice of the backlog.
///
/// The same key filters `get_due_items` and names the actor that processes
/// the slice, so a wake-up for a key reaches the right actor.
pub trait PartitionKey: Send + Sync + fmt::Debug {
    fn name(&self) -> String;
    fn matches(&self, item: &WorkItem) -> bool;
}

/// Every item.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllItems;

impl PartitionKey for AllItems {
    fn name(&self) -> String {
        "all".to_string()
    }

    fn matches(&self, _item: &WorkItem) -> bool {
        true
    }
}

/// Items of one kind.
#[derive(Debug, Clone, Copy)]
pub struct KindKey(pub WorkItemKindTag);

impl PartitionKey for KindKey {
    fn name(&self) -> String {
        format!("kind:{}", self.0.as_str())
    }

    fn matches(&self, item: &WorkItem) -> bool {
        item.kind_tag() == self.0
    }
}

/// Notifications for one delivery channel.
#[derive(Debug, Clone)]
pub struct ChannelKey(pub String);

impl ChannelKey {
    pub fn new(channel_type: impl Into<String>) -> Self {
        Self(channel_type.into())
    }
}

impl PartitionKey for ChannelKey {
    fn name(&self) -> String {
        format!("channel:{}", self.0)
    }

    fn matches(&self, item: &WorkItem) -> bool {
        matches!(&item.kind, WorkItemKind::Notification { channel_type, .. } if *channel_type == self.0)
    }
}

/// Whether item `id` belongs to `partition` out of `partition_count`.
///
/// A count of 0 or 1 means a single partition holding everything.
pub fn partition_matches(id: u64, partition: usize, partition_count: usize) -> bool {
    partition_count <= 1 || id % partition_count as u64 == partition as u64
}

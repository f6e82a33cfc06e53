//! Persistent-style queue of scheduled work.
//!
//! Work items move through a small state machine:
//!
//! ```text
//! NEW ──► DONE
//!  ├───► DROPPED            (deferred max_defer_count times)
//!  └───► DEADLINE_REACHED   (deadline passed while NEW)
//! ```
//!
//! All three end states are terminal. Terminal items are eventually purged
//! and never come back.
//!
//! The backlog is split across cluster nodes by item id: node `position` of
//! `size` owns the items with `id % size == position`.

mod item;
mod memory;
mod partition;
mod store;

pub use item::{
    CursorBearing, DEFAULT_MAX_DEFER_COUNT, TriggerBearing, WorkItem, WorkItemKind,
    WorkItemKindTag, WorkItemState,
};
pub use memory::InMemoryBacklog;
pub use partition::{AllItems, ChannelKey, KindKey, PartitionKey, partition_matches};
pub use store::{BacklogStore, Completion};

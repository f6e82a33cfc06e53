//! Actors that drain the backlog, and the producer side that wakes them.
//!
//! A [`BacklogActor`] owns one partition key. Each run it processes the due
//! items of this node's partition and sleeps until the next item is due,
//! never longer than the idle poll interval. A [`BacklogWriter`] adds items
//! in a transaction and, once committed, wakes the actor early when the new
//! item is due before the actor's planned wake-up.

mod backlog_actor;
mod writer;

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;

use crate::backlog::WorkItem;

pub use backlog_actor::{BacklogActor, BacklogActorOptions};
pub use writer::BacklogWriter;

/// Result of processing one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Processed; the item is completed.
    Completed,
    /// A precondition is not met yet; try again later.
    Deferred,
    /// Processing failed; counts as a deferral.
    Failed(String),
}

/// Processes work items for a backlog actor.
#[async_trait]
pub trait WorkProcessor: Send + Sync {
    async fn process(&self, item: &WorkItem) -> ProcessOutcome;
}

/// The time (epoch millis) a backlog actor next plans to run.
///
/// The actor sets [`WakeTarget::UNKNOWN`] while a run is in progress and
/// only records a real time once the run succeeds, so a failed run leaves
/// the target unknown and every producer wakes the actor again.
#[derive(Debug)]
pub struct WakeTarget(AtomicI64);

impl WakeTarget {
    /// No wake-up planned.
    pub const NONE: i64 = i64::MAX;
    /// A run is in progress or the last one failed.
    pub const UNKNOWN: i64 = i64::MIN;

    pub fn new() -> Self {
        Self(AtomicI64::new(Self::NONE))
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, at: i64) {
        self.0.store(at, Ordering::Release);
    }

    pub fn mark_unknown(&self) {
        self.set(Self::UNKNOWN);
    }

    /// Move the target to `at` if that is earlier. Returns whether the actor
    /// needs waking: `at` was earlier, or the target is unknown.
    pub fn request_wake(&self, at: i64) -> bool {
        let previous = self.0.fetch_min(at, Ordering::AcqRel);
        previous > at || previous == Self::UNKNOWN
    }
}

impl Default for WakeTarget {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_target() {
        let target = WakeTarget::new();
        assert_eq!(target.get(), WakeTarget::NONE);

        assert!(target.request_wake(100));
        assert!(!target.request_wake(100));
        assert!(!target.request_wake(150));
        assert!(target.request_wake(50));
        assert_eq!(target.get(), 50);

        target.set(500);
        assert_eq!(target.get(), 500);
    }

    #[test]
    fn test_unknown_target_always_wakes() {
        let target = WakeTarget::new();
        target.mark_unknown();

        assert!(target.request_wake(100));
        assert!(target.request_wake(150));
        assert_eq!(target.get(), WakeTarget::UNKNOWN);

        target.set(120);
        assert!(!target.request_wake(150));
    }
}

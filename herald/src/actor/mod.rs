//! Named, self-rescheduling units of work.
//!
//! An [`Actor`] is run by the [`ActorManager`] whenever its schedule fires.
//! Each run reports what should happen next: run again after a delay, stop
//! for good, or wait until someone reschedules it.
//!
//! # Architecture
//!
//! - `Actor`: the work body, one async call per run
//! - `ActorManager`: registry of named actors and the reentrancy guard
//! - `RestartTracker`: failure history and exponential backoff
//! - `RetryPolicy`: whether and how a failed actor is retried
//!
//! At most one run of a given actor executes at a time. A run requested while
//! another is in flight is folded into a single queued run.

mod entry;
mod manager;
mod restart_tracker;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use manager::{ActorManager, ActorManagerConfig};
pub use restart_tracker::{RestartTracker, RestartTrackerConfig, RestartTrackerStats, RetryPolicy};

/// What an actor wants after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorOutcome {
    /// Run again after the given delay.
    Reschedule(Duration),
    /// Finished for good. The actor is removed from the registry.
    Done,
    /// Stay registered but idle until rescheduled.
    Suspended,
}

/// Error returned by an actor body.
#[derive(Debug, Clone)]
pub struct ActorError {
    /// Error message.
    pub message: String,
}

impl ActorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ActorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActorError {}

impl From<crate::Error> for ActorError {
    fn from(err: crate::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Result type for actor runs.
pub type ActorResult = Result<ActorOutcome, ActorError>;

/// A unit of work the manager runs on schedule.
#[async_trait]
pub trait Actor: Send + Sync {
    async fn run(&self) -> ActorResult;
}

/// Shared actor handle. Identity is the allocation it points to.
pub type SharedActor = Arc<dyn Actor>;

/// Actor backed by a closure returning a future.
pub struct FnActor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Actor for FnActor<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ActorResult> + Send,
{
    async fn run(&self) -> ActorResult {
        (self.f)().await
    }
}

/// Wrap a closure as a shared actor.
pub fn actor_fn<F, Fut>(f: F) -> SharedActor
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActorResult> + Send + 'static,
{
    Arc::new(FnActor { f })
}

/// Whether two handles point at the same actor instance.
pub(crate) fn same_actor(a: &SharedActor, b: &SharedActor) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

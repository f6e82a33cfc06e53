//! Delayed task execution.
//!
//! A [`Scheduler`] runs a task once after a relative delay. It knows nothing
//! about actors: the actor manager turns "reschedule" decisions into
//! `schedule` calls.
//!
//! # Execution model
//!
//! Scheduling only enqueues. Each scheduled task waits out its delay and then
//! runs on the shared tokio worker pool, so many logical schedules share a few
//! physical threads and a slow task never holds up another schedule.

mod registry;
mod runtime;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

pub use registry::SchedulerRegistry;
pub use runtime::TokioScheduler;

/// Name of the scheduler used when no named scheduler is configured.
pub const DEFAULT_SCHEDULER_NAME: &str = "default";

/// A unit of work handed to a scheduler.
pub type TaskFuture = BoxFuture<'static, ()>;

/// Executes tasks after a delay.
#[async_trait]
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Run `task` once after `delay`. Never blocks the caller.
    fn schedule(&self, task: TaskFuture, delay: Duration) -> ScheduleHandle;

    /// Cancel all pending work immediately. Running tasks finish on their own.
    fn stop(&self);

    /// Cancel pending work and wait up to `timeout` for running tasks to drain.
    async fn stop_with_timeout(&self, timeout: Duration) -> ShutdownReport;

    /// Whether `stop` has been called.
    fn is_stopped(&self) -> bool;
}

/// Cancellable handle to a scheduled task.
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    id: u64,
    token: CancellationToken,
}

impl ScheduleHandle {
    pub(crate) fn new(id: u64, token: CancellationToken) -> Self {
        Self { id, token }
    }

    /// A handle for a task that was never accepted.
    pub(crate) fn rejected() -> Self {
        let token = CancellationToken::new();
        token.cancel();
        Self { id: 0, token }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the task if it has not started yet.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Outcome of a bounded scheduler shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether every task finished before the timeout.
    pub drained: bool,
    /// Tasks still running when the timeout elapsed.
    pub still_running: usize,
}

impl ShutdownReport {
    pub fn drained() -> Self {
        Self {
            drained: true,
            still_running: 0,
        }
    }
}

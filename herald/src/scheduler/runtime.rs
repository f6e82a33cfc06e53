//! Tokio-backed scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{ScheduleHandle, Scheduler, ShutdownReport, TaskFuture};
use crate::{Error, Result};

/// Scheduler that spawns each delayed task onto a tokio runtime.
///
/// Pending tasks hold a child of the scheduler's cancellation token, so
/// `stop` cancels every sleep at once. The task tracker lets shutdown wait
/// for tasks that already started.
#[derive(Debug)]
pub struct TokioScheduler {
    name: String,
    runtime: Handle,
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
    next_id: AtomicU64,
}

impl TokioScheduler {
    /// Create a scheduler on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` when called outside a tokio runtime.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::config(format!("scheduler requires a tokio runtime: {}", e)))?;
        Ok(Self::with_handle(name, runtime))
    }

    /// Create a scheduler that spawns onto the given runtime.
    pub fn with_handle(name: impl Into<String>, runtime: Handle) -> Self {
        Self {
            name: name.into(),
            runtime,
            tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tasks that are sleeping or running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    fn schedule(&self, task: TaskFuture, delay: Duration) -> ScheduleHandle {
        if self.cancellation_token.is_cancelled() {
            warn!(scheduler = %self.name, "Scheduler stopped, rejecting task");
            return ScheduleHandle::rejected();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.cancellation_token.child_token();
        let handle = ScheduleHandle::new(id, token.clone());

        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => task.await,
                }
            },
            &self.runtime,
        );

        handle
    }

    fn stop(&self) {
        if !self.cancellation_token.is_cancelled() {
            info!(scheduler = %self.name, pending = self.tracker.len(), "Stopping scheduler");
        }
        self.cancellation_token.cancel();
        self.tracker.close();
    }

    async fn stop_with_timeout(&self, timeout: Duration) -> ShutdownReport {
        self.stop();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                debug!(scheduler = %self.name, "Scheduler drained");
                ShutdownReport::drained()
            }
            Err(_) => {
                let still_running = self.tracker.len();
                warn!(
                    scheduler = %self.name,
                    still_running,
                    "Scheduler did not drain within {:?}", timeout
                );
                ShutdownReport {
                    drained: false,
                    still_running,
                }
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

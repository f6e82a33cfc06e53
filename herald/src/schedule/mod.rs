//! Schedule computation.
//!
//! A [`Schedule`] answers one question: given the execution history of a piece
//! of recurring work, when is it next due? Implementations are pure with
//! respect to the [`ScheduleContext`] and their injected clock, so calling
//! `next_epoch` twice with the same context yields the same answer.
//!
//! # Stop sentinel
//!
//! A schedule signals "no further executions" by returning the context's
//! `last_scheduled_execution_time` unchanged. Callers check this with
//! [`is_exhausted`] and de-schedule the work.

mod cache;
mod cron_schedule;
mod fixed;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::clock::SharedClock;

pub use cache::ScheduleCache;
pub use cron_schedule::CronSchedule;
pub use fixed::FixedDelaySchedule;

/// Execution history fed to a schedule. All times are epoch millis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleContext {
    /// When the last execution was due.
    pub last_scheduled_execution_time: Option<i64>,
    /// When the last execution actually started.
    pub last_actual_execution_time: Option<i64>,
    /// When the last execution finished.
    pub last_completion_time: Option<i64>,
}

impl ScheduleContext {
    /// Context for work that has never run.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_last_scheduled(mut self, ms: i64) -> Self {
        self.last_scheduled_execution_time = Some(ms);
        self
    }

    pub fn with_last_actual(mut self, ms: i64) -> Self {
        self.last_actual_execution_time = Some(ms);
        self
    }

    pub fn with_last_completion(mut self, ms: i64) -> Self {
        self.last_completion_time = Some(ms);
        self
    }

    /// Whether the work has completed at least once after it was last due.
    pub fn completed_since_scheduled(&self) -> bool {
        match (self.last_completion_time, self.last_scheduled_execution_time) {
            (Some(completed), Some(scheduled)) => completed > scheduled,
            _ => false,
        }
    }
}

/// Computes the next due time of recurring work.
pub trait Schedule: Send + Sync + fmt::Debug {
    /// Next due time in epoch millis for the given history.
    fn next_epoch(&self, ctx: &ScheduleContext) -> i64;
}

/// Shared schedule handle.
pub type SharedSchedule = Arc<dyn Schedule>;

/// Whether `next` is the stop sentinel for `ctx`.
pub fn is_exhausted(ctx: &ScheduleContext, next: i64) -> bool {
    ctx.last_scheduled_execution_time == Some(next)
}

/// Serializable description of a schedule.
///
/// Work items carry a `ScheduleSpec` rather than a live schedule; the
/// [`ScheduleCache`] turns specs into shared [`Schedule`] instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Cron expression (seconds field first, optional year field last).
    Cron {
        expression: String,
        /// IANA timezone name; UTC when absent.
        #[serde(default)]
        timezone: Option<String>,
    },
    /// Fixed delay between the end of one run and the start of the next.
    FixedDelay {
        delay_ms: u64,
        #[serde(default)]
        initial_delay_ms: u64,
    },
}

impl ScheduleSpec {
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
            timezone: None,
        }
    }

    pub fn fixed_delay(delay_ms: u64) -> Self {
        Self::FixedDelay {
            delay_ms,
            initial_delay_ms: 0,
        }
    }

    /// Build a live schedule from this spec.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchedule` for unparseable cron expressions or
    /// unknown timezones.
    pub fn build(&self, clock: SharedClock) -> Result<SharedSchedule> {
        match self {
            Self::Cron {
                expression,
                timezone,
            } => Ok(Arc::new(CronSchedule::new(
                expression,
                timezone.as_deref(),
                clock,
            )?)),
            Self::FixedDelay {
                delay_ms,
                initial_delay_ms,
            } => Ok(Arc::new(FixedDelaySchedule::with_initial_delay(
                std::time::Duration::from_millis(*delay_ms),
                std::time::Duration::from_millis(*initial_delay_ms),
                clock,
            ))),
        }
    }
}

//! Cron-driven schedule.

use std::str::FromStr;

use chrono_tz::Tz;

use super::{Schedule, ScheduleContext};
use crate::clock::{SharedClock, ms_to_datetime};
use crate::{Error, Result};

/// A schedule that fires on the times described by a cron expression.
///
/// Expressions use the `cron` crate grammar: `sec min hour day-of-month month
/// day-of-week [year]`.
#[derive(Debug)]
pub struct CronSchedule {
    expression: String,
    schedule: ::cron::Schedule,
    timezone: Tz,
    clock: SharedClock,
}

impl CronSchedule {
    /// Parse a cron expression, optionally evaluated in an IANA timezone.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchedule` if the expression or timezone is invalid.
    pub fn new(expression: &str, timezone: Option<&str>, clock: SharedClock) -> Result<Self> {
        let schedule = ::cron::Schedule::from_str(expression).map_err(|e| {
            Error::invalid_schedule(format!("invalid cron expression '{}': {}", expression, e))
        })?;

        let timezone: Tz = match timezone {
            Some(tz) => tz.parse().map_err(|_| {
                Error::invalid_schedule(format!("'{}' is not a valid IANA timezone", tz))
            })?,
            None => chrono_tz::UTC,
        };

        Ok(Self {
            expression: expression.to_string(),
            schedule,
            timezone,
            clock,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Earliest matching time strictly after `after_ms`.
    fn next_after(&self, after_ms: i64) -> Option<i64> {
        let after = ms_to_datetime(after_ms).with_timezone(&self.timezone);
        self.schedule
            .after(&after)
            .next()
            .map(|t| t.timestamp_millis())
    }
}

impl Schedule for CronSchedule {
    fn next_epoch(&self, ctx: &ScheduleContext) -> i64 {
        let now = self.clock.now_ms();

        let Some(last_scheduled) = ctx.last_scheduled_execution_time else {
            return self.next_after(now).unwrap_or(now);
        };

        match self.next_after(last_scheduled) {
            Some(next) => next,
            // The expression has no time left after the last scheduled run.
            // Completed since then: hand back the last time to signal stop.
            None if ctx.completed_since_scheduled() => last_scheduled,
            None => now,
        }
    }
}

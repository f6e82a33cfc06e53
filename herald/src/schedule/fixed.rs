//! Fixed-delay schedule.

use std::time::Duration;

use super::{Schedule, ScheduleContext};
use crate::clock::{SharedClock, duration_to_ms};

/// Runs again `delay` after the previous run completed.
#[derive(Debug)]
pub struct FixedDelaySchedule {
    delay: Duration,
    initial_delay: Duration,
    clock: SharedClock,
}

impl FixedDelaySchedule {
    pub fn new(delay: Duration, clock: SharedClock) -> Self {
        Self::with_initial_delay(delay, Duration::ZERO, clock)
    }

    pub fn with_initial_delay(delay: Duration, initial_delay: Duration, clock: SharedClock) -> Self {
        Self {
            delay,
            initial_delay,
            clock,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Schedule for FixedDelaySchedule {
    fn next_epoch(&self, ctx: &ScheduleContext) -> i64 {
        match ctx.last_completion_time {
            Some(completed) => completed.saturating_add(duration_to_ms(self.delay)),
            None => self
                .clock
                .now_ms()
                .saturating_add(duration_to_ms(self.initial_delay)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_first_run_uses_initial_delay() {
        let clock = Arc::new(ManualClock::new(10_000));
        let schedule = FixedDelaySchedule::with_initial_delay(
            Duration::from_secs(60),
            Duration::from_millis(500),
            clock,
        );
        assert_eq!(schedule.next_epoch(&ScheduleContext::new()), 10_500);
    }

    #[test]
    fn test_delay_counts_from_completion() {
        let clock = Arc::new(ManualClock::new(99_999));
        let schedule = FixedDelaySchedule::new(Duration::from_millis(250), clock);
        let ctx = ScheduleContext::new()
            .with_last_scheduled(1_000)
            .with_last_actual(1_010)
            .with_last_completion(1_400);
        assert_eq!(schedule.next_epoch(&ctx), 1_650);
    }
}

//! Cache of built schedules keyed by their spec.

use dashmap::DashMap;
use tracing::debug;

use super::{ScheduleSpec, SharedSchedule};
use crate::Result;
use crate::clock::SharedClock;

/// Parsed schedules, shared by every item carrying the same spec.
///
/// Owned by the component that resolves schedules (the backlog) and passed
/// around by reference; there is no process-wide instance.
#[derive(Debug)]
pub struct ScheduleCache {
    clock: SharedClock,
    schedules: DashMap<ScheduleSpec, SharedSchedule>,
}

impl ScheduleCache {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            schedules: DashMap::new(),
        }
    }

    /// Resolve a spec, building and caching it on first use.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchedule` if the spec cannot be built. Failed
    /// builds are not cached.
    pub fn resolve(&self, spec: &ScheduleSpec) -> Result<SharedSchedule> {
        if let Some(schedule) = self.schedules.get(spec) {
            return Ok(schedule.value().clone());
        }

        let schedule = spec.build(self.clock.clone())?;
        debug!(?spec, "Built schedule");
        Ok(self
            .schedules
            .entry(spec.clone())
            .or_insert(schedule)
            .value()
            .clone())
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    pub fn clear(&self) {
        self.schedules.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_resolve_caches_by_spec() {
        let cache = ScheduleCache::new(Arc::new(ManualClock::new(0)));
        let spec = ScheduleSpec::fixed_delay(100);

        let a = cache.resolve(&spec).unwrap();
        let b = cache.resolve(&spec).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        cache.resolve(&ScheduleSpec::cron("0 * * * * *")).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_invalid_spec_not_cached() {
        let cache = ScheduleCache::new(Arc::new(ManualClock::new(0)));
        assert!(cache.resolve(&ScheduleSpec::cron("bogus")).is_err());
        assert!(cache.is_empty());
    }
}

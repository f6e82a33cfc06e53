//! Scheduler lookup by schedule name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;

use super::{Scheduler, ShutdownReport};

/// Maps schedule names to schedulers, falling back to a default.
///
/// Constructed once at startup and passed to the components that schedule
/// work.
#[derive(Debug)]
pub struct SchedulerRegistry {
    default: Arc<dyn Scheduler>,
    named: RwLock<HashMap<String, Arc<dyn Scheduler>>>,
}

impl SchedulerRegistry {
    pub fn new(default: Arc<dyn Scheduler>) -> Self {
        Self {
            default,
            named: RwLock::new(HashMap::new()),
        }
    }

    /// Register a scheduler for a schedule name, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, scheduler: Arc<dyn Scheduler>) {
        let name = name.into();
        info!(schedule = %name, "Registering named scheduler");
        self.named.write().insert(name, scheduler);
    }

    /// The scheduler for `name`, or the default one.
    pub fn get(&self, name: &str) -> Arc<dyn Scheduler> {
        self.named
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn default_scheduler(&self) -> Arc<dyn Scheduler> {
        self.default.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.named.read().keys().cloned().collect()
    }

    /// Stop every scheduler, named ones first, each bounded by `timeout`.
    pub async fn stop_all(&self, timeout: Duration) -> Vec<(String, ShutdownReport)> {
        let named: Vec<(String, Arc<dyn Scheduler>)> = self
            .named
            .read()
            .iter()
            .map(|(name, scheduler)| (name.clone(), scheduler.clone()))
            .collect();

        let mut reports = Vec::with_capacity(named.len() + 1);
        for (name, scheduler) in named {
            reports.push((name, scheduler.stop_with_timeout(timeout).await));
        }
        reports.push((
            super::DEFAULT_SCHEDULER_NAME.to_string(),
            self.default.stop_with_timeout(timeout).await,
        ));
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;

    #[tokio::test]
    async fn test_get_falls_back_to_default() {
        let default: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new("default").unwrap());
        let digest: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new("digest").unwrap());
        let registry = SchedulerRegistry::new(default.clone());
        registry.register("digest", digest.clone());

        assert!(Arc::ptr_eq(&registry.get("digest"), &digest));
        assert!(Arc::ptr_eq(&registry.get("unknown"), &default));
        assert_eq!(registry.names(), vec!["digest".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_all_stops_everything() {
        let default: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new("default").unwrap());
        let registry = SchedulerRegistry::new(default.clone());
        registry.register("digest", Arc::new(TokioScheduler::new("digest").unwrap()));

        let reports = registry.stop_all(Duration::from_millis(100)).await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|(_, r)| r.drained));
        assert!(registry.get("digest").is_stopped());
        assert!(default.is_stopped());
    }
}

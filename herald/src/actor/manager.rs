//! Actor registry and run loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::entry::ActorEntry;
use super::restart_tracker::{RestartTracker, RetryPolicy};
use super::{ActorOutcome, SharedActor, same_actor};
use crate::cluster::{
    ClusterCoordinator, ClusterEvent, ClusterEventKind, ClusterNodeInfo, EventCategory, ListenerId,
};
use crate::scheduler::{Scheduler, ShutdownReport, TaskFuture};
use crate::{Error, Result};

/// Actor manager configuration.
#[derive(Debug, Clone, Default)]
pub struct ActorManagerConfig {
    /// Retry failed runs with backoff. `None` suspends an actor on failure.
    pub retry_policy: Option<RetryPolicy>,
}

struct Retry {
    policy: RetryPolicy,
    tracker: RestartTracker,
}

struct ManagerInner {
    entries: DashMap<String, Arc<ActorEntry>>,
    scheduler: Arc<dyn Scheduler>,
    coordinator: Option<Arc<ClusterCoordinator>>,
    retry: Option<Retry>,
    event_listener: Mutex<Option<ListenerId>>,
}

/// Registry of named actors.
///
/// Each registered name maps to exactly one actor instance. Scheduling an
/// actor hands a task to the scheduler; when the task fires, the manager
/// runs the actor unless a run is already in flight, in which case at most
/// one further run is queued behind it.
///
/// With a cluster coordinator attached, `reschedule_actor` also asks every
/// other node to run its actor of the same name, and reschedule requests
/// from other nodes are applied locally.
#[derive(Clone)]
pub struct ActorManager {
    inner: Arc<ManagerInner>,
}

impl ActorManager {
    /// Create a manager for a single node.
    pub fn new(scheduler: Arc<dyn Scheduler>, config: ActorManagerConfig) -> Self {
        Self::build(scheduler, None, config)
    }

    /// Create a manager that exchanges reschedule requests through `coordinator`.
    pub fn clustered(
        scheduler: Arc<dyn Scheduler>,
        coordinator: Arc<ClusterCoordinator>,
        config: ActorManagerConfig,
    ) -> Self {
        let manager = Self::build(scheduler, Some(coordinator.clone()), config);

        let weak: Weak<ManagerInner> = Arc::downgrade(&manager.inner);
        let id = coordinator.subscribe(
            EventCategory::ActorReschedule,
            Arc::new(move |event: &ClusterEvent| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let ClusterEventKind::RescheduleActor {
                    actor_name,
                    delay_ms,
                } = &event.kind
                {
                    inner.apply_remote_reschedule(actor_name, *delay_ms);
                }
            }),
        );
        *manager.inner.event_listener.lock() = Some(id);

        manager
    }

    fn build(
        scheduler: Arc<dyn Scheduler>,
        coordinator: Option<Arc<ClusterCoordinator>>,
        config: ActorManagerConfig,
    ) -> Self {
        let retry = config.retry_policy.map(|policy| Retry {
            tracker: RestartTracker::with_config(policy.tracker_config()),
            policy,
        });

        Self {
            inner: Arc::new(ManagerInner {
                entries: DashMap::new(),
                scheduler,
                coordinator,
                retry,
                event_listener: Mutex::new(None),
            }),
        }
    }

    /// Register an actor without scheduling it.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if `name` maps to a different actor instance.
    pub fn register_suspended_actor(&self, name: &str, actor: SharedActor) -> Result<()> {
        self.inner.insert(name, actor).map(|_| ())
    }

    /// Register an actor and schedule its first run after `initial_delay_ms`.
    ///
    /// Registering the same instance again under the same name just
    /// schedules it.
    pub fn register_actor(
        &self,
        name: &str,
        actor: SharedActor,
        initial_delay_ms: i64,
    ) -> Result<()> {
        self.inner.register(name, actor, initial_delay_ms)
    }

    /// Schedule a registered actor here and on every other cluster node.
    pub fn reschedule_actor(&self, name: &str, delay_ms: i64) -> Result<()> {
        self.wake_actor(name, delay_ms)?;

        if let Some(coordinator) = &self.inner.coordinator {
            coordinator.fire_event_exclude_self(ClusterEvent::reschedule_actor(name, delay_ms));
        }
        Ok(())
    }

    /// Schedule a registered actor on this node only.
    pub fn wake_actor(&self, name: &str, delay_ms: i64) -> Result<()> {
        let delay = delay_from_ms(delay_ms)?;
        let entry = self
            .inner
            .get(name)
            .ok_or_else(|| Error::NotRegistered(name.to_string()))?;
        self.inner.schedule_entry(&entry, delay);
        Ok(())
    }

    /// Handle that does not keep the manager alive.
    pub(crate) fn downgrade(&self) -> WeakActorManager {
        WeakActorManager(Arc::downgrade(&self.inner))
    }

    /// Remove an actor. A run in flight finishes but is not rescheduled.
    pub fn remove_actor(&self, name: &str) -> Result<()> {
        if self.inner.remove(name) {
            Ok(())
        } else {
            Err(Error::NotRegistered(name.to_string()))
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.entries.contains_key(name)
    }

    pub fn actor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Keep an actor registered only while this node is the cluster coordinator.
    ///
    /// The actor is registered (and scheduled after `delay_ms`) whenever the
    /// published cluster view makes this node coordinator, and removed when a
    /// later view does not.
    ///
    /// # Errors
    ///
    /// `Configuration` if the manager has no cluster coordinator.
    pub fn register_coordinator_actor(
        &self,
        name: &str,
        actor: SharedActor,
        delay_ms: i64,
    ) -> Result<()> {
        delay_from_ms(delay_ms)?;
        let coordinator = self
            .inner
            .coordinator
            .clone()
            .ok_or_else(|| Error::config("coordinator actors need a cluster coordinator"))?;

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let name = name.to_string();
        coordinator.add_node_info_listener(Arc::new(move |info: &ClusterNodeInfo| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let registered = inner.entries.contains_key(&name);

            if info.is_coordinator && !registered {
                info!(actor = %name, version = info.cluster_version, "Became coordinator, starting actor");
                if let Err(e) = inner.register(&name, actor.clone(), delay_ms) {
                    warn!(actor = %name, error = %e, "Failed to start coordinator actor");
                }
            } else if !info.is_coordinator && registered {
                info!(actor = %name, version = info.cluster_version, "No longer coordinator, stopping actor");
                inner.remove(&name);
            }
        }));

        Ok(())
    }

    /// Remove every actor and stop the scheduler.
    pub async fn stop(&self, timeout: Duration) -> ShutdownReport {
        if let (Some(coordinator), Some(id)) =
            (&self.inner.coordinator, self.inner.event_listener.lock().take())
        {
            coordinator.unsubscribe(id);
        }

        let names: Vec<String> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in &names {
            self.inner.remove(name);
        }

        info!(actors = names.len(), "Stopping actor manager");
        self.inner.scheduler.stop_with_timeout(timeout).await
    }
}

/// Weak reference to an [`ActorManager`], held by cluster listeners.
#[derive(Clone)]
pub(crate) struct WeakActorManager(Weak<ManagerInner>);

impl WeakActorManager {
    pub(crate) fn upgrade(&self) -> Option<ActorManager> {
        self.0.upgrade().map(|inner| ActorManager { inner })
    }
}

impl std::fmt::Debug for ActorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorManager")
            .field("actors", &self.actor_names())
            .field("scheduler", &self.inner.scheduler)
            .field("clustered", &self.inner.coordinator.is_some())
            .finish()
    }
}

impl ManagerInner {
    fn get(&self, name: &str) -> Option<Arc<ActorEntry>> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    fn insert(&self, name: &str, actor: SharedActor) -> Result<Arc<ActorEntry>> {
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(occupied) => {
                if same_actor(&occupied.get().actor, &actor) {
                    Ok(occupied.get().clone())
                } else {
                    Err(Error::AlreadyRegistered(name.to_string()))
                }
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::new(ActorEntry::new(name.to_string(), actor));
                vacant.insert(entry.clone());
                debug!(actor = %name, "Registered actor");
                Ok(entry)
            }
        }
    }

    fn register(
        self: &Arc<Self>,
        name: &str,
        actor: SharedActor,
        initial_delay_ms: i64,
    ) -> Result<()> {
        let delay = delay_from_ms(initial_delay_ms)?;
        let entry = self.insert(name, actor)?;
        self.schedule_entry(&entry, delay);
        Ok(())
    }

    fn remove(&self, name: &str) -> bool {
        let Some((_, entry)) = self.entries.remove(name) else {
            return false;
        };
        entry.cancel();
        if let Some(retry) = &self.retry {
            retry.tracker.remove(name);
        }
        debug!(actor = %name, "Removed actor");
        true
    }

    fn apply_remote_reschedule(self: &Arc<Self>, name: &str, delay_ms: i64) {
        let Some(entry) = self.get(name) else {
            trace!(actor = %name, "Ignoring reschedule for unknown actor");
            return;
        };
        let delay = Duration::from_millis(delay_ms.max(0) as u64);
        debug!(actor = %name, delay_ms, "Applying reschedule from cluster");
        self.schedule_entry(&entry, delay);
    }

    fn schedule_entry(self: &Arc<Self>, entry: &Arc<ActorEntry>, delay: Duration) {
        if entry.is_cancelled() {
            return;
        }
        let handle = self
            .scheduler
            .schedule(fire(self.clone(), entry.clone()), delay);
        entry.set_handle(handle.clone());
        if entry.is_cancelled() {
            handle.cancel();
        }
        trace!(actor = %entry.name, ?delay, "Scheduled actor");
    }

    /// Run the actor once and act on its outcome. The caller holds `running`.
    async fn run_once(self: &Arc<Self>, entry: &Arc<ActorEntry>) {
        if entry.is_cancelled() {
            trace!(actor = %entry.name, "Skipping run of removed actor");
            return;
        }

        let result = AssertUnwindSafe(entry.actor.run()).catch_unwind().await;

        let failure = match result {
            Ok(Ok(outcome)) => {
                if let Some(retry) = &self.retry {
                    retry.tracker.clear_failures(&entry.name);
                }
                match outcome {
                    ActorOutcome::Reschedule(delay) => self.schedule_entry(entry, delay),
                    ActorOutcome::Done => {
                        // Queued and pending firings of this entry must not run again.
                        entry.cancel();
                        let removed = self
                            .entries
                            .remove_if(&entry.name, |_, current| Arc::ptr_eq(current, entry))
                            .is_some();
                        if removed {
                            if let Some(retry) = &self.retry {
                                retry.tracker.remove(&entry.name);
                            }
                            debug!(actor = %entry.name, "Actor finished");
                        }
                    }
                    ActorOutcome::Suspended => {
                        trace!(actor = %entry.name, "Actor suspended");
                    }
                }
                return;
            }
            Ok(Err(e)) => e.message,
            Err(panic) => panic_message(panic.as_ref()),
        };

        self.handle_failure(entry, &failure);
    }

    fn handle_failure(self: &Arc<Self>, entry: &Arc<ActorEntry>, failure: &str) {
        let Some(retry) = &self.retry else {
            error!(actor = %entry.name, error = %failure, "Actor failed, suspending");
            return;
        };

        let (failures, backoff) = retry.tracker.record_failure(&entry.name);
        if failures < retry.policy.max_failures {
            warn!(
                actor = %entry.name,
                error = %failure,
                failures,
                ?backoff,
                "Actor failed, retrying"
            );
            self.schedule_entry(entry, backoff);
        } else {
            error!(
                actor = %entry.name,
                error = %failure,
                failures,
                "Actor failed too many times, suspending"
            );
        }
    }
}

/// Task handed to the scheduler for one firing of an actor.
///
/// Runs immediately when the actor is idle. Otherwise the first task to
/// claim the waiting slot queues behind the running one; every other task
/// returns without running.
fn fire(inner: Arc<ManagerInner>, entry: Arc<ActorEntry>) -> TaskFuture {
    Box::pin(async move {
        let _running = match entry.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                if !entry.try_claim_waiting() {
                    trace!(actor = %entry.name, "Run already queued, dropping firing");
                    return;
                }
                let guard = entry.running.lock().await;
                entry.release_waiting();
                guard
            }
        };

        inner.run_once(&entry).await;
    })
}

fn delay_from_ms(delay_ms: i64) -> Result<Duration> {
    u64::try_from(delay_ms)
        .map(Duration::from_millis)
        .map_err(|_| Error::InvalidDelay(delay_ms))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::actor::{ActorError, actor_fn};
    use crate::scheduler::TokioScheduler;

    fn manager(config: ActorManagerConfig) -> ActorManager {
        ActorManager::new(Arc::new(TokioScheduler::new("test").unwrap()), config)
    }

    fn counting_actor(counter: &Arc<AtomicUsize>, outcome: ActorOutcome) -> SharedActor {
        let counter = counter.clone();
        actor_fn(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(outcome)
            }
        })
    }

    #[tokio::test]
    async fn test_register_runs_and_suspends() {
        let manager = manager(ActorManagerConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));

        manager
            .register_actor("a", counting_actor(&counter, ActorOutcome::Suspended), 0)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(manager.is_registered("a"));
    }

    #[tokio::test]
    async fn test_suspended_registration_does_not_run() {
        let manager = manager(ActorManagerConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));

        manager
            .register_suspended_actor("a", counting_actor(&counter, ActorOutcome::Suspended))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        manager.reschedule_actor("a", 0).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registration_identity() {
        let manager = manager(ActorManagerConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let actor = counting_actor(&counter, ActorOutcome::Suspended);

        manager.register_suspended_actor("a", actor.clone()).unwrap();
        manager.register_suspended_actor("a", actor).unwrap();

        let other = counting_actor(&counter, ActorOutcome::Suspended);
        assert!(matches!(
            manager.register_actor("a", other, 0),
            Err(Error::AlreadyRegistered(name)) if name == "a"
        ));
        assert_eq!(manager.actor_names(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_misuse_errors() {
        let manager = manager(ActorManagerConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));

        assert!(matches!(
            manager.reschedule_actor("missing", 0),
            Err(Error::NotRegistered(_))
        ));
        assert!(matches!(
            manager.remove_actor("missing"),
            Err(Error::NotRegistered(_))
        ));
        assert!(matches!(
            manager.register_actor("a", counting_actor(&counter, ActorOutcome::Done), -1),
            Err(Error::InvalidDelay(-1))
        ));
        assert!(!manager.is_registered("a"));

        let actor = counting_actor(&counter, ActorOutcome::Done);
        manager.register_suspended_actor("b", actor).unwrap();
        assert!(matches!(
            manager.reschedule_actor("b", -5),
            Err(Error::InvalidDelay(-5))
        ));
        assert!(matches!(
            manager.register_coordinator_actor("c", counting_actor(&counter, ActorOutcome::Done), 0),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_done_removes_actor() {
        let manager = manager(ActorManagerConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));

        manager
            .register_actor("a", counting_actor(&counter, ActorOutcome::Done), 0)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!manager.is_registered("a"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_done_discards_firing_queued_during_run() {
        let manager = manager(ActorManagerConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let finishing = actor_fn(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok(ActorOutcome::Done)
                } else {
                    Ok(ActorOutcome::Reschedule(Duration::from_millis(20)))
                }
            }
        });

        manager.register_actor("a", finishing, 0).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.reschedule_actor("a", 0).unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!manager.is_registered("a"));
    }

    #[tokio::test]
    async fn test_remove_cancels_pending_run() {
        let manager = manager(ActorManagerConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));

        manager
            .register_actor("a", counting_actor(&counter, ActorOutcome::Suspended), 50)
            .unwrap();
        manager.remove_actor("a").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!manager.is_registered("a"));
    }

    #[tokio::test]
    async fn test_failures_suspend_without_retry_policy() {
        let manager = manager(ActorManagerConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let failing = actor_fn(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ActorError::new("boom"))
                } else {
                    panic!("kaboom")
                }
            }
        });

        manager.register_actor("a", failing, 0).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(manager.is_registered("a"));

        manager.reschedule_actor("a", 0).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(manager.is_registered("a"));
    }

    #[tokio::test]
    async fn test_retry_policy_bounds_retries() {
        let manager = manager(ActorManagerConfig {
            retry_policy: Some(RetryPolicy {
                max_failures: 3,
                base_backoff_ms: 5,
                max_backoff_ms: 20,
                failure_window_ms: 60_000,
            }),
        });
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let failing = actor_fn(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ActorError::new("always fails"))
            }
        });

        manager.register_actor("a", failing, 0).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(manager.is_registered("a"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reschedules_fold_into_one_run() {
        let manager = manager(ActorManagerConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let slow = actor_fn(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                }
                Ok(ActorOutcome::Suspended)
            }
        });

        manager.register_actor("a", slow, 0).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.reschedule_actor("a", 0) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stop_clears_registry() {
        let manager = manager(ActorManagerConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));

        manager
            .register_actor("a", counting_actor(&counter, ActorOutcome::Suspended), 1_000)
            .unwrap();
        let report = manager.stop(Duration::from_secs(1)).await;

        assert!(report.drained);
        assert!(manager.actor_names().is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}

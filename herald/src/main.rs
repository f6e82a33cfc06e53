use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use herald::actor::{ActorError, ActorManager, ActorOutcome, actor_fn};
use herald::backlog::{AllItems, BacklogStore, InMemoryBacklog, WorkItem};
use herald::clock::system_clock;
use herald::cluster::{ClusterCoordinator, StandaloneMembership};
use herald::dispatch::{BacklogActor, ProcessOutcome, WorkProcessor};
use herald::logging::init_logging;
use herald::scheduler::{SchedulerRegistry, TokioScheduler};
use herald::{EngineConfig, Result};

const BACKLOG_ACTOR: &str = "backlog";
const PURGE_ACTOR: &str = "backlog-purge";
const PURGE_AGE_MS: i64 = 60 * 60 * 1000;

/// Logs each item and completes it.
struct LoggingProcessor;

#[async_trait]
impl WorkProcessor for LoggingProcessor {
    async fn process(&self, item: &WorkItem) -> ProcessOutcome {
        info!(item_id = item.id, kind = item.kind_tag().as_str(), "Processing work item");
        ProcessOutcome::Completed
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::from_env()?;
    let (logging, _guard) = init_logging(&config.logging)?;
    info!(filter = %logging.get_filter(), "Logging initialized");
    #[cfg(unix)]
    spawn_filter_reload(logging.clone());

    let clock = system_clock();
    let registry = SchedulerRegistry::new(Arc::new(TokioScheduler::new("default")?));
    let coordinator = ClusterCoordinator::start(Arc::new(StandaloneMembership::default()));
    let manager = ActorManager::clustered(
        registry.get(BACKLOG_ACTOR),
        coordinator.clone(),
        config.actor_manager_config(),
    );

    let backlog: Arc<dyn BacklogStore> = Arc::new(
        InMemoryBacklog::new(clock.clone()).with_default_max_defer_count(config.default_max_defer_count),
    );

    let actor = BacklogActor::new(
        backlog.clone(),
        Arc::new(LoggingProcessor),
        Arc::new(AllItems),
        clock.clone(),
    )
    .with_coordinator(coordinator.clone())
    .with_options(config.backlog_actor_options());
    actor.route_wakeups(&manager, BACKLOG_ACTOR);
    manager.register_actor(BACKLOG_ACTOR, Arc::new(actor), 0)?;

    let purge_store = backlog.clone();
    let purge_clock = clock.clone();
    let purge_interval = config.backlog_actor_options().idle_poll_interval;
    manager.register_coordinator_actor(
        PURGE_ACTOR,
        actor_fn(move || {
            let store = purge_store.clone();
            let cutoff = purge_clock.now_ms() - PURGE_AGE_MS;
            async move {
                store.purge_terminal(cutoff).await?;
                Ok::<_, ActorError>(ActorOutcome::Reschedule(purge_interval))
            }
        }),
        0,
    )?;

    info!(actors = ?manager.actor_names(), "herald started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutting down");
    let report = manager.stop(config.shutdown_timeout()).await;
    if !report.drained {
        info!(still_running = report.still_running, "Actors still running at shutdown");
    }
    registry.stop_all(config.shutdown_timeout()).await;

    Ok(())
}

/// Re-read the log filter from `.env` on SIGHUP.
#[cfg(unix)]
fn spawn_filter_reload(logging: Arc<herald::logging::LoggingConfig>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Failed to listen for SIGHUP, log filter reload disabled");
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            let result = EngineConfig::from_env_file(".env")
                .and_then(|config| logging.set_filter(&config.logging.filter));
            if let Err(e) = result {
                warn!(error = %e, "Failed to reload log filter");
            }
        }
    });
}

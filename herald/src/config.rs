//! Engine configuration.
//!
//! Values come from defaults, a JSON document, or `HERALD_*` environment
//! variables (with `.env` support through `dotenvy`):
//!
//! | Variable | Field |
//! |---|---|
//! | `HERALD_SHUTDOWN_TIMEOUT_MS` | `shutdown_timeout_ms` |
//! | `HERALD_BATCH_LIMIT` | `batch_limit` |
//! | `HERALD_IDLE_POLL_MS` | `idle_poll_interval_ms` |
//! | `HERALD_DEFER_DELAY_MS` | `defer_delay_ms` |
//! | `HERALD_MAX_DEFER_COUNT` | `default_max_defer_count` |
//! | `HERALD_TRANSACTION_TIMEOUT_MS` | `transaction_timeout_ms` |
//! | `HERALD_RETRY_MAX_FAILURES` | `retry_policy.max_failures` (enables retries) |
//! | `HERALD_RETRY_BASE_BACKOFF_MS` | `retry_policy.base_backoff_ms` |
//! | `HERALD_RETRY_MAX_BACKOFF_MS` | `retry_policy.max_backoff_ms` |
//! | `HERALD_LOG` | `logging.filter` |
//! | `HERALD_LOG_JSON` | `logging.json` |
//! | `HERALD_LOG_DIR` | `logging.dir` |

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::actor::{ActorManagerConfig, RetryPolicy};
use crate::dispatch::BacklogActorOptions;
use crate::logging::LogOptions;
use crate::transaction::TransactionBoundary;
use crate::{Error, Result};

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long shutdown waits for running actors.
    pub shutdown_timeout_ms: u64,
    /// Most backlog items processed per actor run.
    pub batch_limit: usize,
    /// Longest sleep of an idle backlog actor.
    pub idle_poll_interval_ms: u64,
    /// How far a deferred item moves into the future.
    pub defer_delay_ms: u64,
    /// Deferrals allowed before an item is dropped, when the item sets none.
    pub default_max_defer_count: u32,
    pub transaction_timeout_ms: u64,
    /// Retry failed actor runs. Disabled when `None`.
    pub retry_policy: Option<RetryPolicy>,
    pub logging: LogOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 30_000,
            batch_limit: 100,
            idle_poll_interval_ms: 60_000,
            defer_delay_ms: 5_000,
            default_max_defer_count: crate::backlog::DEFAULT_MAX_DEFER_COUNT,
            transaction_timeout_ms: 30_000,
            retry_policy: None,
            logging: LogOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from a dotenv-format file. Process variables fill in keys the
    /// file does not set.
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut vars = HashMap::new();
        let iter = dotenvy::from_path_iter(path)
            .map_err(|e| Error::config(format!("Failed to read {}: {}", path.display(), e)))?;
        for entry in iter {
            let (key, value) = entry
                .map_err(|e| Error::config(format!("Invalid line in {}: {}", path.display(), e)))?;
            vars.insert(key, value);
        }
        Self::from_lookup(|key| vars.get(key).cloned().or_else(|| std::env::var(key).ok()))
    }

    /// Load from a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `HERALD_*` variables resolved by `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse(&lookup, "HERALD_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout_ms = v;
        }
        if let Some(v) = parse(&lookup, "HERALD_BATCH_LIMIT")? {
            config.batch_limit = v;
        }
        if let Some(v) = parse(&lookup, "HERALD_IDLE_POLL_MS")? {
            config.idle_poll_interval_ms = v;
        }
        if let Some(v) = parse(&lookup, "HERALD_DEFER_DELAY_MS")? {
            config.defer_delay_ms = v;
        }
        if let Some(v) = parse(&lookup, "HERALD_MAX_DEFER_COUNT")? {
            config.default_max_defer_count = v;
        }
        if let Some(v) = parse(&lookup, "HERALD_TRANSACTION_TIMEOUT_MS")? {
            config.transaction_timeout_ms = v;
        }

        if let Some(max_failures) = parse(&lookup, "HERALD_RETRY_MAX_FAILURES")? {
            let mut policy = RetryPolicy {
                max_failures,
                ..Default::default()
            };
            if let Some(v) = parse(&lookup, "HERALD_RETRY_BASE_BACKOFF_MS")? {
                policy.base_backoff_ms = v;
            }
            if let Some(v) = parse(&lookup, "HERALD_RETRY_MAX_BACKOFF_MS")? {
                policy.max_backoff_ms = v;
            }
            config.retry_policy = Some(policy);
        }

        if let Some(filter) = lookup("HERALD_LOG") {
            config.logging.filter = filter;
        }
        if let Some(v) = parse(&lookup, "HERALD_LOG_JSON")? {
            config.logging.json = v;
        }
        if let Some(dir) = lookup("HERALD_LOG_DIR") {
            config.logging.dir = Some(PathBuf::from(dir));
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_limit == 0 {
            return Err(Error::config("batch_limit must be positive"));
        }
        if self.idle_poll_interval_ms == 0 {
            return Err(Error::config("idle_poll_interval_ms must be positive"));
        }
        if self.transaction_timeout_ms == 0 {
            return Err(Error::config("transaction_timeout_ms must be positive"));
        }
        if let Some(policy) = &self.retry_policy {
            if policy.max_failures == 0 {
                return Err(Error::config("retry_policy.max_failures must be positive"));
            }
            if policy.base_backoff_ms > policy.max_backoff_ms {
                return Err(Error::config(
                    "retry_policy.base_backoff_ms exceeds max_backoff_ms",
                ));
            }
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn transaction_boundary(&self) -> TransactionBoundary {
        TransactionBoundary::new(Duration::from_millis(self.transaction_timeout_ms))
    }

    pub fn actor_manager_config(&self) -> ActorManagerConfig {
        ActorManagerConfig {
            retry_policy: self.retry_policy.clone(),
        }
    }

    pub fn backlog_actor_options(&self) -> BacklogActorOptions {
        BacklogActorOptions {
            batch_limit: self.batch_limit,
            idle_poll_interval: Duration::from_millis(self.idle_poll_interval_ms),
            defer_delay: Duration::from_millis(self.defer_delay_ms),
        }
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::config(format!("Invalid value for {}: {:?} ({})", key, raw, e))),
        None => Ok(None),
    }
}

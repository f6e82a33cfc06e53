//! Failure tracking and retry backoff for actors.
//!
//! # Backoff Algorithm
//!
//! - Failures below the threshold within the failure window: no backoff
//! - From the threshold on: backoff = base * 2^(failures - threshold)
//! - Backoff is capped at max_backoff
//! - Failures older than the window are forgotten

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Default base backoff duration (1 second).
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Default maximum backoff duration (5 minutes).
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Default failure window (10 minutes).
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(600);

/// Default failure threshold before applying backoff.
pub const DEFAULT_FAILURE_THRESHOLD: usize = 1;

/// Default number of consecutive failures after which retries stop.
pub const DEFAULT_MAX_FAILURES: usize = 5;

/// Maximum exponent to prevent overflow.
const MAX_EXPONENT: u32 = 10;

/// Configuration for the restart tracker.
#[derive(Debug, Clone)]
pub struct RestartTrackerConfig {
    /// Base backoff duration.
    pub base_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Window for counting failures.
    pub failure_window: Duration,
    /// Number of failures before applying backoff.
    pub failure_threshold: usize,
}

impl Default for RestartTrackerConfig {
    fn default() -> Self {
        Self {
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            failure_window: DEFAULT_FAILURE_WINDOW,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Retry behaviour for failed actor runs.
///
/// A failed run is rescheduled after the tracker's backoff until the actor
/// has failed `max_failures` times within the failure window; after that it
/// stays suspended until rescheduled explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_failures: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub failure_window_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            base_backoff_ms: DEFAULT_BASE_BACKOFF.as_millis() as u64,
            max_backoff_ms: DEFAULT_MAX_BACKOFF.as_millis() as u64,
            failure_window_ms: DEFAULT_FAILURE_WINDOW.as_millis() as u64,
        }
    }
}

impl RetryPolicy {
    pub fn tracker_config(&self) -> RestartTrackerConfig {
        RestartTrackerConfig {
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            failure_window: Duration::from_millis(self.failure_window_ms),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Failure history for a single actor.
#[derive(Debug, Clone, Default)]
struct FailureHistory {
    /// Timestamps of recent failures.
    failures: Vec<Instant>,
    /// Total failure count.
    total_failures: u64,
}

impl FailureHistory {
    /// Record a failure and return the number of recent failures.
    fn record_failure(&mut self, now: Instant, window: Duration) -> usize {
        self.failures.retain(|&t| now.duration_since(t) < window);
        self.failures.push(now);
        self.total_failures += 1;
        self.failures.len()
    }

    fn recent_failures(&self, now: Instant, window: Duration) -> usize {
        self.failures
            .iter()
            .filter(|&&t| now.duration_since(t) < window)
            .count()
    }
}

/// Tracks failure history per actor name and calculates backoff.
#[derive(Debug, Default)]
pub struct RestartTracker {
    history: Mutex<HashMap<String, FailureHistory>>,
    config: RestartTrackerConfig,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::with_config(RestartTrackerConfig::default())
    }

    pub fn with_config(config: RestartTrackerConfig) -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Record a failure and return `(recent_failures, backoff)`.
    pub fn record_failure(&self, actor_name: &str) -> (usize, Duration) {
        let now = Instant::now();
        let failures = self
            .history
            .lock()
            .entry(actor_name.to_string())
            .or_default()
            .record_failure(now, self.config.failure_window);
        let backoff = self.calculate_backoff(failures);

        if backoff.is_zero() {
            debug!(actor = %actor_name, failures, "Actor failed, retrying immediately");
        } else {
            info!(actor = %actor_name, failures, ?backoff, "Actor failed, backing off");
        }

        (failures, backoff)
    }

    /// Formula: base * 2^(failures - threshold) for failures >= threshold.
    fn calculate_backoff(&self, failures: usize) -> Duration {
        if failures < self.config.failure_threshold {
            return Duration::ZERO;
        }

        let exponent = (failures - self.config.failure_threshold).min(MAX_EXPONENT as usize) as u32;
        let multiplier = 2u32.saturating_pow(exponent);
        self.config
            .base_backoff
            .saturating_mul(multiplier)
            .min(self.config.max_backoff)
    }

    pub fn recent_failures(&self, actor_name: &str) -> usize {
        let now = Instant::now();
        self.history
            .lock()
            .get(actor_name)
            .map(|h| h.recent_failures(now, self.config.failure_window))
            .unwrap_or(0)
    }

    pub fn total_failures(&self, actor_name: &str) -> u64 {
        self.history
            .lock()
            .get(actor_name)
            .map(|h| h.total_failures)
            .unwrap_or(0)
    }

    /// Forget recent failures after a successful run.
    pub fn clear_failures(&self, actor_name: &str) {
        if let Some(history) = self.history.lock().get_mut(actor_name) {
            if !history.failures.is_empty() {
                debug!(actor = %actor_name, "Clearing failure history");
                history.failures.clear();
            }
        }
    }

    /// Stop tracking an actor.
    pub fn remove(&self, actor_name: &str) {
        self.history.lock().remove(actor_name);
    }

    pub fn stats(&self) -> RestartTrackerStats {
        let now = Instant::now();
        let history = self.history.lock();
        RestartTrackerStats {
            total_actors: history.len(),
            actors_with_failures: history
                .values()
                .filter(|h| h.recent_failures(now, self.config.failure_window) > 0)
                .count(),
            total_failures: history.values().map(|h| h.total_failures).sum(),
        }
    }
}

/// Statistics from the restart tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartTrackerStats {
    pub total_actors: usize,
    pub actors_with_failures: usize,
    pub total_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> RestartTracker {
        RestartTracker::with_config(RestartTrackerConfig {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            failure_window: Duration::from_secs(60),
            failure_threshold: 1,
        })
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let tracker = tracker();
        let delays: Vec<_> = (0..6).map(|_| tracker.record_failure("a").1).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1000),
                Duration::from_millis(1000),
            ]
        );
    }

    #[test]
    fn test_below_threshold_is_immediate() {
        let tracker = RestartTracker::with_config(RestartTrackerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        assert_eq!(tracker.record_failure("a").1, Duration::ZERO);
        assert_eq!(tracker.record_failure("a").1, Duration::ZERO);
        assert_eq!(tracker.record_failure("a").1, DEFAULT_BASE_BACKOFF);
    }

    #[test]
    fn test_clear_and_remove() {
        let tracker = tracker();
        tracker.record_failure("a");
        tracker.record_failure("b");
        assert_eq!(tracker.recent_failures("a"), 1);

        tracker.clear_failures("a");
        assert_eq!(tracker.recent_failures("a"), 0);
        assert_eq!(tracker.total_failures("a"), 1);

        tracker.remove("b");
        let stats = tracker.stats();
        assert_eq!(stats.total_actors, 1);
        assert_eq!(stats.actors_with_failures, 0);
        assert_eq!(stats.total_failures, 1);
    }

    #[test]
    fn test_retry_policy_tracker_config() {
        let policy = RetryPolicy {
            base_backoff_ms: 20,
            ..Default::default()
        };
        let config = policy.tracker_config();
        assert_eq!(config.base_backoff, Duration::from_millis(20));
        assert_eq!(config.failure_threshold, 1);
    }
}

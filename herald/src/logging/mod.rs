//! Logging setup with a reloadable filter.
//!
//! This module provides:
//! - Runtime log level changes via `tracing_subscriber::reload`
//! - Local timezone timestamps
//! - Optional JSON output
//! - Optional daily rolling log files

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "herald=info";

/// File name prefix of rolling log files.
const LOG_FILE_PREFIX: &str = "herald.log";

/// Timer that formats timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Logging options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Filter directive, e.g. `herald=debug`. `RUST_LOG` wins when set.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Also write daily rolling files into this directory.
    pub dir: Option<PathBuf>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
            dir: None,
        }
    }
}

/// Handle to the installed subscriber's filter.
pub struct LoggingConfig {
    handle: FilterHandle,
}

impl LoggingConfig {
    /// Get the current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Set a new filter directive.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("Invalid filter directive: {}", e)))?;

        self.handle
            .reload(new_filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }
}

/// Install the global subscriber.
///
/// Returns the filter handle and, when file output is enabled, the guard
/// that flushes the file writer. Keep the guard alive for the process
/// lifetime.
pub fn init_logging(options: &LogOptions) -> Result<(Arc<LoggingConfig>, Option<WorkerGuard>)> {
    let initial_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.filter))
        .map_err(|e| Error::config(format!("Invalid filter directive: {}", e)))?;
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    let (file_writer, guard) = match &options.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let console_text = (!options.json).then(|| fmt::layer().with_ansi(true).with_timer(LocalTimer));
    let console_json = options
        .json
        .then(|| fmt::layer().json().with_timer(LocalTimer));
    let file = file_writer.map(|writer| {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_timer(LocalTimer)
    });

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_text)
        .with(console_json)
        .with(file)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok((Arc::new(LoggingConfig { handle: filter_handle }), guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = LogOptions::default();
        assert_eq!(options.filter, "herald=info");
        assert!(!options.json);
        assert!(options.dir.is_none());
    }

    #[test]
    fn test_local_timer_format() {
        let mut out = String::new();
        LocalTimer.format_time(&mut Writer::new(&mut out)).unwrap();
        assert_eq!(out.len(), "2024-01-01T00:00:00.000+00:00".len());
        assert_eq!(&out[10..11], "T");
    }

    #[test]
    fn test_set_filter_replaces_directive() {
        let (_layer, handle) = reload::Layer::new(EnvFilter::new(DEFAULT_LOG_FILTER));
        let logging = LoggingConfig { handle };
        assert_eq!(logging.get_filter(), DEFAULT_LOG_FILTER);

        logging.set_filter("herald=debug").unwrap();
        assert_eq!(logging.get_filter(), "herald=debug");

        assert!(logging.set_filter("herald=[").is_err());
        assert_eq!(logging.get_filter(), "herald=debug");
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: LogOptions = serde_json::from_str(r#"{"json": true}"#).unwrap();
        assert!(options.json);
        assert_eq!(options.filter, DEFAULT_LOG_FILTER);
    }
}

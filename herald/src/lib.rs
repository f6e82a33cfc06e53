//! herald: recurring-work scheduling and dispatch.
//!
//! Named actors run on a shared scheduler with an at-most-one-concurrent-run
//! guarantee. A backlog of work items is split across cluster nodes and
//! drained by backlog actors, and producers wake those actors early through
//! post-commit listeners and cluster broadcast.

pub mod actor;
pub mod backlog;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod schedule;
pub mod scheduler;
pub mod transaction;

pub use config::EngineConfig;
pub use error::{Error, Result};

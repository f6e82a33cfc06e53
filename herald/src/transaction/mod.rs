//! Transaction boundaries for backlog writes.
//!
//! A transaction is an ambient, task-local scope. Stores that support it
//! stage their writes as commit actions; the boundary applies them when the
//! body succeeds and then runs post-commit listeners. A failed or timed-out
//! body discards both.
//!
//! The scope follows the future passed to [`run_in_transaction`]. Work
//! spawned onto other tasks from inside the body is outside the transaction.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::{Error, Result};

type Action = Box<dyn FnOnce() + Send + 'static>;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT: Arc<TransactionContext>;
}

struct TransactionContext {
    id: u64,
    rollback_only: AtomicBool,
    commit_actions: Mutex<Vec<Action>>,
    post_commit: Mutex<Vec<Action>>,
}

impl TransactionContext {
    fn new() -> Self {
        Self {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            rollback_only: AtomicBool::new(false),
            commit_actions: Mutex::new(Vec::new()),
            post_commit: Mutex::new(Vec::new()),
        }
    }

    fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::Acquire)
    }

    fn mark_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::Release);
    }

    fn commit(&self) {
        let actions = std::mem::take(&mut *self.commit_actions.lock());
        let listeners = std::mem::take(&mut *self.post_commit.lock());
        trace!(
            transaction = self.id,
            actions = actions.len(),
            listeners = listeners.len(),
            "Committing transaction"
        );

        for action in actions {
            action();
        }

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(listener)).is_err() {
                error!(transaction = self.id, "Post-commit listener panicked");
            }
        }
    }

    fn rollback(&self) {
        let discarded = std::mem::take(&mut *self.commit_actions.lock()).len();
        self.post_commit.lock().clear();
        debug!(transaction = self.id, discarded, "Rolled back transaction");
    }
}

fn current() -> Option<Arc<TransactionContext>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Whether the calling task is inside a transaction.
pub fn in_transaction() -> bool {
    current().is_some()
}

/// Run `body` inside a transaction.
///
/// With `join_if_possible` and a healthy ambient transaction, `body` joins
/// it: its writes commit with the outer transaction, and its failure marks
/// the outer transaction rollback-only. Otherwise `body` gets a transaction
/// of its own, committed when it returns `Ok` and rolled back when it fails,
/// times out, or a joined body failed.
///
/// # Errors
///
/// - the body's own error, after rollback
/// - `TransactionTimeout` when `timeout` elapses first
/// - `RolledBack` when the body succeeded but a joined body failed
pub async fn run_in_transaction<F, Fut, T>(
    timeout: Duration,
    join_if_possible: bool,
    body: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if join_if_possible {
        if let Some(ambient) = current().filter(|ctx| !ctx.is_rollback_only()) {
            trace!(transaction = ambient.id, "Joining ambient transaction");
            let result = match tokio::time::timeout(timeout, body()).await {
                Ok(result) => result,
                Err(_) => Err(Error::TransactionTimeout(timeout)),
            };
            if let Err(e) = &result {
                warn!(transaction = ambient.id, error = %e, "Joined transaction failed, marking rollback-only");
                ambient.mark_rollback_only();
            }
            return result;
        }
    }

    let ctx = Arc::new(TransactionContext::new());
    trace!(transaction = ctx.id, "Starting transaction");

    let outcome = CURRENT
        .scope(ctx.clone(), tokio::time::timeout(timeout, body()))
        .await;

    match outcome {
        Ok(Ok(value)) if !ctx.is_rollback_only() => {
            ctx.commit();
            Ok(value)
        }
        Ok(Ok(_)) => {
            ctx.rollback();
            Err(Error::RolledBack(format!(
                "transaction {} was marked rollback-only",
                ctx.id
            )))
        }
        Ok(Err(e)) => {
            ctx.rollback();
            Err(e)
        }
        Err(_) => {
            warn!(transaction = ctx.id, ?timeout, "Transaction timed out");
            ctx.rollback();
            Err(Error::TransactionTimeout(timeout))
        }
    }
}

/// Run `listener` after the ambient transaction commits.
///
/// Listeners run in registration order, after all staged writes are applied.
/// They do not run if the transaction rolls back.
///
/// # Errors
///
/// `NoActiveTransaction` outside a transaction.
pub fn register_post_commit_listener<F>(listener: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let ctx = current().ok_or(Error::NoActiveTransaction)?;
    ctx.post_commit.lock().push(Box::new(listener));
    Ok(())
}

/// Stage `action` to run on commit of the ambient transaction.
///
/// Outside a transaction the action runs immediately.
pub(crate) fn stage_or_apply<F>(action: F)
where
    F: FnOnce() + Send + 'static,
{
    match current() {
        Some(ctx) => ctx.commit_actions.lock().push(Box::new(action)),
        None => action(),
    }
}

/// Transaction settings shared by callers.
#[derive(Debug, Clone, Copy)]
pub struct TransactionBoundary {
    timeout: Duration,
}

impl TransactionBoundary {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `run_in_transaction` with this boundary's timeout.
    pub async fn run<F, Fut, T>(&self, join_if_possible: bool, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        run_in_transaction(self.timeout, join_if_possible, body).await
    }
}

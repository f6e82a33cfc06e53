//! Per-actor registry entry.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::SharedActor;
use crate::scheduler::ScheduleHandle;

/// Registry record for one named actor.
///
/// `running` serialises runs. `waiting` is the single slot for a run queued
/// behind the one in flight.
pub(crate) struct ActorEntry {
    pub(crate) name: String,
    pub(crate) actor: SharedActor,
    cancelled: AtomicBool,
    pub(crate) running: tokio::sync::Mutex<()>,
    waiting: AtomicBool,
    last_handle: Mutex<Option<ScheduleHandle>>,
}

impl ActorEntry {
    pub(crate) fn new(name: String, actor: SharedActor) -> Self {
        Self {
            name,
            actor,
            cancelled: AtomicBool::new(false),
            running: tokio::sync::Mutex::new(()),
            waiting: AtomicBool::new(false),
            last_handle: Mutex::new(None),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Mark the entry dead and cancel its most recent pending schedule.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(handle) = self.last_handle.lock().take() {
            handle.cancel();
        }
    }

    /// Claim the waiting slot. Fails when another task already holds it.
    pub(crate) fn try_claim_waiting(&self) -> bool {
        self.waiting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_waiting(&self) {
        self.waiting.store(false, Ordering::Release);
    }

    pub(crate) fn set_handle(&self, handle: ScheduleHandle) {
        *self.last_handle.lock() = Some(handle);
    }
}

impl std::fmt::Debug for ActorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorEntry")
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .finish()
    }
}

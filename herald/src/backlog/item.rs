//! Work items and their state machine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;
use crate::schedule::{ScheduleContext, ScheduleSpec};

/// Default number of times an item may be deferred before it is dropped.
pub const DEFAULT_MAX_DEFER_COUNT: u32 = 5;

/// Work item lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemState {
    /// Waiting to be processed.
    #[default]
    New,
    /// Processed successfully.
    Done,
    /// Deferred too many times.
    Dropped,
    /// Not processed before its deadline.
    DeadlineReached,
}

impl WorkItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Done => "DONE",
            Self::Dropped => "DROPPED",
            Self::DeadlineReached => "DEADLINE_REACHED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "DONE" => Some(Self::Done),
            "DROPPED" => Some(Self::Dropped),
            "DEADLINE_REACHED" => Some(Self::DeadlineReached),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::New)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: WorkItemState) -> bool {
        use WorkItemState::*;

        match (self, target) {
            (from, to) if *from == to => true,
            (New, Done | Dropped | DeadlineReached) => true,
            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: WorkItemState) -> Result<WorkItemState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::invalid_transition(self, target))
        }
    }
}

impl std::fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind tag of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKindTag {
    Job,
    JobInstance,
    Notification,
}

impl WorkItemKindTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::JobInstance => "job_instance",
            Self::Notification => "notification",
        }
    }
}

/// What a work item is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkItemKind {
    /// Recurring job definition. Completing it enqueues the next occurrence.
    Job { name: String, trigger: ScheduleSpec },
    /// One execution of a job, resumable from `cursor`.
    JobInstance {
        job_id: u64,
        #[serde(default)]
        cursor: Option<String>,
    },
    /// Message for a delivery channel.
    Notification { channel_type: String, payload: Value },
}

impl WorkItemKind {
    pub fn tag(&self) -> WorkItemKindTag {
        match self {
            Self::Job { .. } => WorkItemKindTag::Job,
            Self::JobInstance { .. } => WorkItemKindTag::JobInstance,
            Self::Notification { .. } => WorkItemKindTag::Notification,
        }
    }
}

/// Items that carry a recurring trigger.
pub trait TriggerBearing {
    fn trigger(&self) -> Option<&ScheduleSpec>;
}

/// Items that can resume from a saved position.
pub trait CursorBearing {
    fn cursor(&self) -> Option<&str>;
    fn set_cursor(&mut self, cursor: Option<String>) -> bool;
}

impl TriggerBearing for WorkItemKind {
    fn trigger(&self) -> Option<&ScheduleSpec> {
        match self {
            Self::Job { trigger, .. } => Some(trigger),
            _ => None,
        }
    }
}

impl CursorBearing for WorkItemKind {
    fn cursor(&self) -> Option<&str> {
        match self {
            Self::JobInstance { cursor, .. } => cursor.as_deref(),
            _ => None,
        }
    }

    /// Returns `false` for kinds without a cursor.
    fn set_cursor(&mut self, new_cursor: Option<String>) -> bool {
        match self {
            Self::JobInstance { cursor, .. } => {
                *cursor = new_cursor;
                true
            }
            _ => false,
        }
    }
}

/// A unit of work held in the backlog. Times are epoch millis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Assigned by the store; 0 until added.
    pub id: u64,
    pub kind: WorkItemKind,
    /// Routing key for cluster wake-ups about this item.
    pub partition_key: String,
    pub state: WorkItemState,
    /// When the item becomes due. Computed from `schedule` on add when unset.
    pub schedule_time: Option<i64>,
    pub creation_time: i64,
    pub last_execution_time: Option<i64>,
    /// Last time the state changed.
    pub state_changed_at: i64,
    pub defer_count: u32,
    /// Store default applies on add when unset.
    pub max_defer_count: Option<u32>,
    pub deadline: Option<i64>,
    /// Schedule used when `schedule_time` is unset. Falls back to a job's trigger.
    pub schedule: Option<ScheduleSpec>,
}

impl WorkItem {
    pub fn new(kind: WorkItemKind) -> Self {
        let partition_key = match &kind {
            WorkItemKind::Notification { channel_type, .. } => channel_type.clone(),
            other => other.tag().as_str().to_string(),
        };

        Self {
            id: 0,
            kind,
            partition_key,
            state: WorkItemState::New,
            schedule_time: None,
            creation_time: 0,
            last_execution_time: None,
            state_changed_at: 0,
            defer_count: 0,
            max_defer_count: None,
            deadline: None,
            schedule: None,
        }
    }

    pub fn job(name: impl Into<String>, trigger: ScheduleSpec) -> Self {
        Self::new(WorkItemKind::Job {
            name: name.into(),
            trigger,
        })
    }

    pub fn job_instance(job_id: u64, cursor: Option<String>) -> Self {
        Self::new(WorkItemKind::JobInstance { job_id, cursor })
    }

    pub fn notification(channel_type: impl Into<String>, payload: Value) -> Self {
        Self::new(WorkItemKind::Notification {
            channel_type: channel_type.into(),
            payload,
        })
    }

    pub fn with_schedule_time(mut self, schedule_time: i64) -> Self {
        self.schedule_time = Some(schedule_time);
        self
    }

    pub fn with_deadline(mut self, deadline: i64) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_defer_count(mut self, max_defer_count: u32) -> Self {
        self.max_defer_count = Some(max_defer_count);
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleSpec) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = partition_key.into();
        self
    }

    pub fn kind_tag(&self) -> WorkItemKindTag {
        self.kind.tag()
    }

    /// Schedule that decides this item's due times.
    pub fn effective_schedule(&self) -> Option<&ScheduleSpec> {
        self.schedule.as_ref().or_else(|| self.kind.trigger())
    }

    pub fn effective_max_defer_count(&self) -> u32 {
        self.max_defer_count.unwrap_or(DEFAULT_MAX_DEFER_COUNT)
    }

    /// Whether the item is new and due at `now`.
    pub fn is_due(&self, now: i64) -> bool {
        self.state == WorkItemState::New && self.schedule_time.is_some_and(|t| t <= now)
    }

    pub fn is_past_deadline(&self, now: i64) -> bool {
        self.state == WorkItemState::New && self.deadline.is_some_and(|d| d <= now)
    }

    /// Whether the defer policy requires dropping this item.
    pub fn defer_limit_reached(&self) -> bool {
        self.defer_count >= self.effective_max_defer_count()
    }

    /// Execution history of this occurrence, completed at `completed_at`.
    pub fn schedule_context(&self, completed_at: i64) -> ScheduleContext {
        let mut ctx = ScheduleContext::new().with_last_completion(completed_at);
        if let Some(scheduled) = self.schedule_time {
            ctx = ctx.with_last_scheduled(scheduled);
        }
        if let Some(actual) = self.last_execution_time {
            ctx = ctx.with_last_actual(actual);
        }
        ctx
    }
}

impl TriggerBearing for WorkItem {
    fn trigger(&self) -> Option<&ScheduleSpec> {
        self.kind.trigger()
    }
}

impl CursorBearing for WorkItem {
    fn cursor(&self) -> Option<&str> {
        self.kind.cursor()
    }

    fn set_cursor(&mut self, cursor: Option<String>) -> bool {
        self.kind.set_cursor(cursor)
    }
}

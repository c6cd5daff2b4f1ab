use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::types::{BranchId, EventId, SubjectId};

/// Closed enumeration of state-changing facts the engine records.
///
/// The set is deliberately small: every mutation the executor performs maps
/// to exactly one of these, and the projector knows how to apply each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunCreated,
    StepCompleted,
    StepFailed,
    RunPaused,
    RunResumed,
    RunCancelled,
    RunCompleted,
    BranchCreated,
    SubjectUpdated,
}

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "RUN_CREATED",
            Self::StepCompleted => "STEP_COMPLETED",
            Self::StepFailed => "STEP_FAILED",
            Self::RunPaused => "RUN_PAUSED",
            Self::RunResumed => "RUN_RESUMED",
            Self::RunCancelled => "RUN_CANCELLED",
            Self::RunCompleted => "RUN_COMPLETED",
            Self::BranchCreated => "BRANCH_CREATED",
            Self::SubjectUpdated => "SUBJECT_UPDATED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single immutable fact in the log.
///
/// Once appended an event is never mutated or deleted. `parent_event_id`
/// always names an event that already exists (the branch head at append
/// time), so the chain from any event to its root is acyclic and finite by
/// construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub parent_event_id: Option<EventId>,
    pub branch_id: BranchId,
    /// Recorded for audit only; ordering is by parent linkage, not time.
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub subject_id: SubjectId,
    pub payload: Value,
}

impl Event {
    pub(crate) fn new(
        parent_event_id: Option<EventId>,
        branch_id: BranchId,
        event_type: EventType,
        subject_id: SubjectId,
        payload: Value,
    ) -> Self {
        Self {
            id: EventId::new(),
            parent_event_id,
            branch_id,
            timestamp: Utc::now(),
            event_type,
            subject_id,
            payload,
        }
    }
}

use miette::Diagnostic;
use thiserror::Error;

use crate::types::{BranchId, EventId};

/// Errors raised by the event log and branch index.
#[derive(Debug, Error, Diagnostic)]
pub enum LogError {
    /// Append or read addressed a branch that does not exist.
    #[error("unknown branch: {branch}")]
    #[diagnostic(
        code(branchloom::event_log::unknown_branch),
        help("Create the branch first, or check the id came from this log.")
    )]
    UnknownBranch { branch: BranchId },

    /// Read addressed an event id that does not exist in this log.
    #[error("unknown event: {event}")]
    #[diagnostic(code(branchloom::event_log::unknown_event))]
    UnknownEvent { event: EventId },

    /// Optimistic-concurrency loss: the branch head moved between the
    /// caller's read and the append. Transient; retry with `current_head`
    /// as the expected parent.
    #[error("head conflict on branch {branch}: expected {expected:?}, head is {current_head:?}")]
    #[diagnostic(
        code(branchloom::event_log::head_conflict),
        help("Re-read the branch head and retry the append with it.")
    )]
    HeadConflict {
        branch: BranchId,
        expected: Option<EventId>,
        current_head: Option<EventId>,
    },

    /// Fork checkout point is not reachable from the source branch head.
    #[error("checkout event {event} is not reachable from branch {branch}")]
    #[diagnostic(
        code(branchloom::event_log::unknown_checkout_event),
        help("The checkout event must lie on the source branch's parent chain.")
    )]
    UnknownCheckoutEvent { event: EventId, branch: BranchId },

    /// An event chain referenced a parent that is missing from the log.
    /// Fatal integrity error: the log is corrupt, halt rather than guess.
    #[error("log corruption: event {event} references missing parent {missing_parent}")]
    #[diagnostic(
        code(branchloom::event_log::consistency_violation),
        severity(error),
        help("The log is corrupt. Do not continue projecting; alert and investigate.")
    )]
    ConsistencyViolation {
        event: EventId,
        missing_parent: EventId,
    },
}

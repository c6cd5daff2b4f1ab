//! Core identifier and lifecycle types for the Branchloom engine.
//!
//! This module defines the newtype identifiers used throughout the system
//! (events, branches, runs, definitions, steps, subjects) and the run
//! lifecycle enumeration. These are the core domain concepts; execution
//! infrastructure lives in [`crate::runs`].
//!
//! # Examples
//!
//! ```rust
//! use branchloom::types::{RunState, StepId};
//!
//! let step: StepId = "approve".into();
//! assert_eq!(step.as_str(), "approve");
//!
//! assert!(RunState::Completed.is_terminal());
//! assert!(!RunState::PausedForUser.is_terminal());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0.simple())
            }
        }
    };
}

uuid_id!(
    /// Identifier of a single immutable event in the log.
    EventId,
    "evt"
);
uuid_id!(
    /// Identifier of a branch (an independent line of event history).
    BranchId,
    "br"
);
uuid_id!(
    /// Identifier of a workflow run.
    RunId,
    "run"
);
uuid_id!(
    /// Identifier of a stored workflow definition.
    DefinitionId,
    "def"
);

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of a step within a definition. Author-chosen, unique per
    /// definition, validated at save time.
    StepId
);
string_id!(
    /// Stable identifier addressing a subject (entity) in the entity store
    /// and in projected state.
    SubjectId
);

/// Lifecycle state of a workflow run.
///
/// Transitions: `Pending → Running → (PausedForUser ⇄ Running)* →
/// {Completed | Failed | Cancelled}`. Terminal states admit no further
/// advancement; a failed run is restarted explicitly as a new run, never
/// retried implicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Created but not yet claimed by the executor.
    Pending,
    /// Owned exclusively by the executor; steps are advancing.
    Running,
    /// Suspended at a human checkpoint; ownership rests with whoever holds
    /// the resume token. No worker is held while paused.
    PausedForUser,
    /// All steps visited; terminal.
    Completed,
    /// A step handler failed; terminal.
    Failed,
    /// Cancelled by the caller; terminal.
    Cancelled,
}

impl RunState {
    /// Returns `true` for states that admit no further transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::PausedForUser => "PAUSED_FOR_USER",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

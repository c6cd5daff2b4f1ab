//! Step category handlers and model resolution.
//!
//! Each step category has a distinct execution contract:
//!
//! - **Context** reads subjects from the entity store; no side effects
//!   beyond the read.
//! - **Transform** is a pure function of the payload; no external I/O.
//! - **Human** carries no handler at all; reaching one pauses the run.
//! - **Execute** performs an effectful collaborator call with a resolved
//!   model configuration ([`resolve`]).
//! - **Logic** routes, loops, and combines; its driver lives in the
//!   executor because loops re-enter dispatch, but its pieces (condition
//!   evaluation, fragment combination) are here.
//!
//! Handlers return a [`StepOutcome`]: the payload fragment to merge plus any
//! subject writes for the executor to persist and record.

pub mod handlers;
pub mod resolve;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::collaborators::{EntityStoreError, GenerationError};
use crate::types::{StepId, SubjectId};

pub use handlers::{run_context, run_execute, run_merge_outputs, run_transform};
pub use resolve::{first_match, resolve_model, subject_model_preference};

/// The five step categories. Used for per-category model defaults and for
/// reporting; dispatch itself is by [`StepKind`](crate::definitions::StepKind)
/// variant, resolved at validation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    Context,
    Transform,
    Human,
    Execute,
    Logic,
}

/// Result of a successful step handler invocation.
#[derive(Clone, Debug, Default)]
pub struct StepOutcome {
    /// Payload fragment to merge into the run payload (last-writer-wins).
    pub output: FxHashMap<String, Value>,
    /// Subject writes performed by the step, to be recorded as
    /// `SubjectUpdated` events by the executor.
    pub subject_writes: Vec<(SubjectId, Value)>,
}

impl StepOutcome {
    #[must_use]
    pub fn with_output(key: impl Into<String>, value: Value) -> Self {
        let mut output = FxHashMap::default();
        output.insert(key.into(), value);
        Self {
            output,
            subject_writes: Vec::new(),
        }
    }
}

/// Fatal step handler errors. Any of these transitions the run to `Failed`;
/// nothing is retried automatically.
#[derive(Debug, Error, Diagnostic)]
pub enum StepError {
    /// A payload key the step depends on is missing.
    #[error("step {step}: missing payload key {key:?}")]
    #[diagnostic(
        code(branchloom::steps::missing_input),
        help("Check that an upstream step produced the required key.")
    )]
    MissingInput { step: StepId, key: String },

    /// A context step addressed a subject the entity store does not hold.
    #[error("step {step}: subject not found: {subject}")]
    #[diagnostic(code(branchloom::steps::missing_subject))]
    MissingSubject { step: StepId, subject: SubjectId },

    #[error("generation failed: {0}")]
    #[diagnostic(code(branchloom::steps::generation))]
    Generation(#[from] GenerationError),

    #[error("entity store failed: {0}")]
    #[diagnostic(code(branchloom::steps::entity_store))]
    EntityStore(#[from] EntityStoreError),
}

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::collaborators::ModelConfig;
use crate::event_log::{Event, EventType};
use crate::types::{BranchId, DefinitionId, RunId, RunState, StepId};

/// Per-execution state owned by the executor while running.
///
/// This is a cache: the event chain on `branch_id` is the source of truth,
/// and [`Run::replay`] rebuilds an equivalent `Run` from it.
#[derive(Clone, Debug)]
pub struct Run {
    pub id: RunId,
    pub definition_id: DefinitionId,
    pub branch_id: BranchId,
    pub state: RunState,
    /// Index into the compiled mainline order of the next step to consider.
    pub cursor: usize,
    /// The step the run is paused at or failed on, if any.
    pub current_step: Option<StepId>,
    pub payload: FxHashMap<String, Value>,
    /// Model overrides supplied per step (at resume time), the top rung of
    /// the resolution cascade.
    pub step_overrides: FxHashMap<StepId, ModelConfig>,
    /// Steps skipped by routing decisions or resume skip flags.
    pub skipped: FxHashSet<StepId>,
    pub executed: FxHashSet<StepId>,
    /// Route chosen by each completed `if_else` step.
    pub route_choices: FxHashMap<StepId, StepId>,
    /// Error detail when `state == Failed`.
    pub failure: Option<String>,
}

impl Run {
    #[must_use]
    pub fn new(
        id: RunId,
        definition_id: DefinitionId,
        branch_id: BranchId,
        initial_payload: FxHashMap<String, Value>,
    ) -> Self {
        Self {
            id,
            definition_id,
            branch_id,
            state: RunState::Pending,
            cursor: 0,
            current_step: None,
            payload: initial_payload,
            step_overrides: FxHashMap::default(),
            skipped: FxHashSet::default(),
            executed: FxHashSet::default(),
            route_choices: FxHashMap::default(),
            failure: None,
        }
    }

    /// Merge a step output or resume edit into the payload,
    /// last-writer-wins per key.
    pub fn merge_payload(&mut self, fragment: &FxHashMap<String, Value>) {
        for (k, v) in fragment {
            self.payload.insert(k.clone(), v.clone());
        }
    }

    /// Immutable snapshot for callers and the streaming surface.
    #[must_use]
    pub fn view(&self) -> RunView {
        let mut payload = serde_json::Map::new();
        let mut keys: Vec<_> = self.payload.keys().collect();
        keys.sort();
        for k in keys {
            payload.insert(k.clone(), self.payload[k].clone());
        }
        RunView {
            id: self.id,
            definition_id: self.definition_id,
            branch_id: self.branch_id,
            state: self.state,
            current_step: self.current_step.clone(),
            payload: Value::Object(payload),
            failure: self.failure.clone(),
        }
    }

    /// Rebuild a run from its branch's event chain (chronological order).
    ///
    /// Used on restart and for reads of terminal runs after their slot left
    /// the live arena: replay events, not trust memory.
    pub fn replay(events: &[Event]) -> Result<Self, ReplayError> {
        let mut run: Option<Run> = None;
        for event in events {
            match event.event_type {
                EventType::BranchCreated | EventType::SubjectUpdated => {}
                EventType::RunCreated => {
                    let fields = payload_object(event)?;
                    let id: RunId = field(event, fields, "run_id")?;
                    let definition_id: DefinitionId = field(event, fields, "definition_id")?;
                    let initial: FxHashMap<String, Value> =
                        field(event, fields, "initial_payload")?;
                    let mut r = Run::new(id, definition_id, event.branch_id, initial);
                    r.state = RunState::Running;
                    run = Some(r);
                }
                _ => {
                    let r = run.as_mut().ok_or(ReplayError::MissingRunCreated {
                        branch: event.branch_id,
                    })?;
                    apply(r, event)?;
                }
            }
        }
        run.ok_or(ReplayError::NoRunOnBranch)
    }
}

fn apply(run: &mut Run, event: &Event) -> Result<(), ReplayError> {
    match event.event_type {
        EventType::StepCompleted => {
            let fields = payload_object(event)?;
            let step: StepId = field(event, fields, "step_id")?;
            if let Some(Value::Object(output)) = fields.get("output") {
                for (k, v) in output {
                    run.payload.insert(k.clone(), v.clone());
                }
            }
            if let Some(chosen) = fields.get("chosen_route")
                && let Ok(chosen) = serde_json::from_value::<StepId>(chosen.clone())
            {
                run.route_choices.insert(step.clone(), chosen);
            }
            run.executed.insert(step);
        }
        EventType::StepFailed => {
            let fields = payload_object(event)?;
            run.current_step = Some(field(event, fields, "step_id")?);
            run.failure = fields
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string);
            run.state = RunState::Failed;
        }
        EventType::RunPaused => {
            let fields = payload_object(event)?;
            run.current_step = Some(field(event, fields, "at_step")?);
            run.state = RunState::PausedForUser;
        }
        EventType::RunResumed => {
            let fields = payload_object(event)?;
            if let Some(raw) = fields.get("resume") {
                let resume: ResumePayload = serde_json::from_value(raw.clone())
                    .map_err(|source| ReplayError::MalformedPayload {
                        event: event.id,
                        source,
                    })?;
                run.merge_payload(&resume.edits);
                run.step_overrides.extend(resume.model_overrides);
                run.skipped.extend(resume.skip_steps);
            }
            if let Some(step) = run.current_step.take() {
                run.executed.insert(step);
            }
            run.state = RunState::Running;
        }
        EventType::RunCancelled => run.state = RunState::Cancelled,
        EventType::RunCompleted => {
            run.current_step = None;
            run.state = RunState::Completed;
        }
        EventType::RunCreated | EventType::BranchCreated | EventType::SubjectUpdated => {}
    }
    Ok(())
}

fn payload_object(event: &Event) -> Result<&serde_json::Map<String, Value>, ReplayError> {
    event
        .payload
        .as_object()
        .ok_or(ReplayError::NonObjectPayload { event: event.id })
}

fn field<T: serde::de::DeserializeOwned>(
    event: &Event,
    fields: &serde_json::Map<String, Value>,
    key: &'static str,
) -> Result<T, ReplayError> {
    let raw = fields.get(key).ok_or(ReplayError::MissingField {
        event: event.id,
        field: key,
    })?;
    serde_json::from_value(raw.clone()).map_err(|source| ReplayError::MalformedPayload {
        event: event.id,
        source,
    })
}

/// Failures while rebuilding a run from its event chain. These indicate a
/// chain that was not written by this engine (or was corrupted), never a
/// recoverable caller mistake.
#[derive(Debug, Error, Diagnostic)]
pub enum ReplayError {
    #[error("branch {branch} has run events before RUN_CREATED")]
    #[diagnostic(code(branchloom::runs::replay_order))]
    MissingRunCreated { branch: BranchId },

    #[error("branch contains no run")]
    #[diagnostic(code(branchloom::runs::no_run))]
    NoRunOnBranch,

    #[error("event {event} payload is not an object")]
    #[diagnostic(code(branchloom::runs::non_object_payload))]
    NonObjectPayload { event: crate::types::EventId },

    #[error("event {event} payload missing field {field:?}")]
    #[diagnostic(code(branchloom::runs::missing_field))]
    MissingField {
        event: crate::types::EventId,
        field: &'static str,
    },

    #[error("event {event} payload malformed: {source}")]
    #[diagnostic(code(branchloom::runs::malformed_payload))]
    MalformedPayload {
        event: crate::types::EventId,
        #[source]
        source: serde_json::Error,
    },
}

/// Caller-supplied data merged into a paused run before execution
/// continues: payload edits, per-step model overrides, and skip flags.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResumePayload {
    #[serde(default)]
    pub edits: FxHashMap<String, Value>,
    #[serde(default)]
    pub model_overrides: FxHashMap<StepId, ModelConfig>,
    #[serde(default)]
    pub skip_steps: Vec<StepId>,
}

impl ResumePayload {
    /// Resume with no changes: continue exactly where the run paused.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_edit(mut self, key: impl Into<String>, value: Value) -> Self {
        self.edits.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_model_override(mut self, step: impl Into<StepId>, model: ModelConfig) -> Self {
        self.model_overrides.insert(step.into(), model);
        self
    }

    #[must_use]
    pub fn with_skip(mut self, step: impl Into<StepId>) -> Self {
        self.skip_steps.push(step.into());
        self
    }
}

/// Immutable snapshot of a run, returned by the control surface and pushed
/// on the streaming channel at every state or step transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunView {
    pub id: RunId,
    pub definition_id: DefinitionId,
    pub branch_id: BranchId,
    pub state: RunState,
    pub current_step: Option<StepId>,
    pub payload: Value,
    pub failure: Option<String>,
}

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::collaborators::{EntityStore, GenerationService, ModelConfig};
use crate::config::EngineConfig;
use crate::definitions::{
    CompiledDefinition, DefinitionStore, ExecuteSpec, LogicKind, Step, StepKind, ValidationError,
};
use crate::event_log::{EventLog, EventType, LogError};
use crate::steps::{
    StepCategory, StepError, StepOutcome, resolve_model, run_context, run_execute,
    run_merge_outputs, run_transform, subject_model_preference,
};
use crate::stream::StreamHub;
use crate::types::{BranchId, DefinitionId, RunId, RunState, StepId, SubjectId};

use super::run::{ReplayError, ResumePayload, Run, RunView};

/// Errors returned synchronously by the run control surface.
///
/// Step execution failures are deliberately absent: they transition the run
/// to `Failed`, are recorded as events, and are reported through the
/// streaming surface rather than as an `Err` from `start`/`resume`.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("definition not found: {definition}")]
    #[diagnostic(code(branchloom::engine::definition_not_found))]
    DefinitionNotFound { definition: DefinitionId },

    #[error("run not found: {run}")]
    #[diagnostic(code(branchloom::engine::run_not_found))]
    RunNotFound { run: RunId },

    /// Protocol misuse: the requested action is not legal from the run's
    /// current state (resume on a non-paused run, cancel on a terminal
    /// run). The run is untouched.
    #[error("cannot {action} run {run} in state {state}")]
    #[diagnostic(
        code(branchloom::engine::invalid_state_transition),
        help("Check the run's current state via get() before issuing control calls.")
    )]
    InvalidStateTransition {
        run: RunId,
        state: RunState,
        action: &'static str,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Replay(#[from] ReplayError),
}

struct RunInner {
    run: Run,
    compiled: Arc<CompiledDefinition>,
}

/// Live arena slot for one run.
///
/// The async mutex is the per-run mutual exclusion: `advance` only ever runs
/// under it, so two advances on the same run cannot overlap. `view` is a
/// lock-free-readable snapshot for `get`/`list` while the run is executing,
/// and `cancel` is the cooperative cancellation flag checked at every step
/// boundary (including right after an in-flight external call returns, so a
/// late result is discarded rather than applied).
struct RunSlot {
    cancel: AtomicBool,
    view: RwLock<RunView>,
    inner: AsyncMutex<RunInner>,
}

enum StepFlow {
    Applied,
    Terminal,
}

/// The DAG executor: owns the live run arena and drives every run's state
/// machine, recording each transition on the run's branch before the
/// in-memory cache moves on.
///
/// Runs leave the arena the moment their terminal event is persisted;
/// afterwards `get`/`list` serve them by replaying their branch.
pub struct Executor {
    log: Arc<EventLog>,
    definitions: Arc<DefinitionStore>,
    generation: Arc<dyn GenerationService>,
    entities: Arc<dyn EntityStore>,
    stream: Arc<StreamHub>,
    config: EngineConfig,
    active: RwLock<FxHashMap<RunId, Arc<RunSlot>>>,
    // One id pair per terminal run, retained for the process lifetime; the
    // log already keeps every event of those runs, so this adds only the
    // lookup entry.
    finished: RwLock<FxHashMap<RunId, BranchId>>,
}

impl Executor {
    #[must_use]
    pub fn new(
        log: Arc<EventLog>,
        definitions: Arc<DefinitionStore>,
        generation: Arc<dyn GenerationService>,
        entities: Arc<dyn EntityStore>,
        stream: Arc<StreamHub>,
        config: EngineConfig,
    ) -> Self {
        Self {
            log,
            definitions,
            generation,
            entities,
            stream,
            config,
            active: RwLock::new(FxHashMap::default()),
            finished: RwLock::new(FxHashMap::default()),
        }
    }

    /// Create a run from a stored definition and drive it until the first
    /// human checkpoint or a terminal state.
    #[instrument(skip(self, initial_payload), err)]
    pub async fn start(
        &self,
        definition_id: DefinitionId,
        initial_payload: FxHashMap<String, Value>,
    ) -> Result<RunView, EngineError> {
        let compiled = self
            .definitions
            .get(definition_id)
            .ok_or(EngineError::DefinitionNotFound {
                definition: definition_id,
            })?;

        let run_id = RunId::new();
        let (branch_id, _root) = self.log.create_branch(format!("run/{run_id}"));
        let mut run = Run::new(run_id, definition_id, branch_id, initial_payload);
        self.append_run_event(
            &run,
            EventType::RunCreated,
            json!({
                "run_id": run.id,
                "definition_id": run.definition_id,
                "initial_payload": run.payload,
            }),
        )?;
        run.state = RunState::Running;

        let slot = Arc::new(RunSlot {
            cancel: AtomicBool::new(false),
            view: RwLock::new(run.view()),
            inner: AsyncMutex::new(RunInner { run, compiled }),
        });
        self.active.write().insert(run_id, slot.clone());
        self.stream.emit(&slot.view.read().clone());

        let mut inner = slot.inner.lock().await;
        self.advance(&slot, &mut inner).await?;
        drop(inner);
        let view = slot.view.read().clone();
        Ok(view)
    }

    /// Resume a paused run with caller-supplied edits, overrides, and skip
    /// flags. Rejected (not ignored) when the run is not paused, so a
    /// duplicate resume surfaces immediately.
    #[instrument(skip(self, resume), err)]
    pub async fn resume(&self, run_id: RunId, resume: ResumePayload) -> Result<RunView, EngineError> {
        let slot = self.active.read().get(&run_id).cloned();
        let Some(slot) = slot else {
            return Err(self.not_resumable(run_id)?);
        };

        let mut inner = slot.inner.lock().await;
        if inner.run.state != RunState::PausedForUser {
            return Err(EngineError::InvalidStateTransition {
                run: run_id,
                state: inner.run.state,
                action: "resume",
            });
        }

        inner.run.merge_payload(&resume.edits);
        inner
            .run
            .step_overrides
            .extend(resume.model_overrides.clone());
        inner.run.skipped.extend(resume.skip_steps.iter().cloned());
        self.append_run_event(&inner.run, EventType::RunResumed, json!({ "resume": resume }))?;
        if let Some(step) = inner.run.current_step.take() {
            inner.run.executed.insert(step);
        }
        inner.run.cursor += 1;
        inner.run.state = RunState::Running;
        self.publish(&slot, &inner.run);

        self.advance(&slot, &mut inner).await?;
        drop(inner);
        let view = slot.view.read().clone();
        Ok(view)
    }

    /// Cooperative cancellation: the flag is set immediately; if the run is
    /// idle (paused) the terminal transition is applied on the spot,
    /// otherwise the advance loop applies it at the next step boundary and
    /// discards any in-flight external result.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, run_id: RunId) -> Result<(), EngineError> {
        let slot = self.active.read().get(&run_id).cloned();
        let Some(slot) = slot else {
            return Err(self.not_resumable(run_id)?);
        };
        slot.cancel.store(true, Ordering::SeqCst);
        if let Ok(mut inner) = slot.inner.try_lock()
            && !inner.run.state.is_terminal()
        {
            self.finish(&slot, &mut inner, EventType::RunCancelled, RunState::Cancelled)?;
        }
        Ok(())
    }

    /// Snapshot of a run: served from the live arena while active, rebuilt
    /// by replaying the run's branch once terminal.
    pub fn get(&self, run_id: RunId) -> Result<RunView, EngineError> {
        if let Some(slot) = self.active.read().get(&run_id) {
            return Ok(slot.view.read().clone());
        }
        if let Some(branch) = self.finished.read().get(&run_id).copied() {
            let run = Run::replay(&self.log.events_for_branch(branch)?)?;
            return Ok(run.view());
        }
        Err(EngineError::RunNotFound { run: run_id })
    }

    /// All runs, optionally filtered by state.
    pub fn list(&self, filter_by_state: Option<RunState>) -> Result<Vec<RunView>, EngineError> {
        let mut views: Vec<RunView> = self
            .active
            .read()
            .values()
            .map(|slot| slot.view.read().clone())
            .collect();
        let finished: Vec<BranchId> = self.finished.read().values().copied().collect();
        for branch in finished {
            views.push(Run::replay(&self.log.events_for_branch(branch)?)?.view());
        }
        if let Some(state) = filter_by_state {
            views.retain(|v| v.state == state);
        }
        views.sort_by_key(|v| v.id);
        Ok(views)
    }

    /// Terminal-or-missing lookup shared by resume and cancel error paths.
    /// Returns the error to raise (wrapped in `Ok` for `?` on log/replay
    /// failures along the way).
    fn not_resumable(&self, run_id: RunId) -> Result<EngineError, EngineError> {
        if let Some(branch) = self.finished.read().get(&run_id).copied() {
            let run = Run::replay(&self.log.events_for_branch(branch)?)?;
            return Ok(EngineError::InvalidStateTransition {
                run: run_id,
                state: run.state,
                action: "control",
            });
        }
        Ok(EngineError::RunNotFound { run: run_id })
    }

    /// The advance loop: pops the next ready step in topological order and
    /// dispatches it. Only ever entered under the run's slot mutex.
    async fn advance(&self, slot: &RunSlot, inner: &mut RunInner) -> Result<(), EngineError> {
        loop {
            if slot.cancel.load(Ordering::SeqCst) {
                self.finish(slot, inner, EventType::RunCancelled, RunState::Cancelled)?;
                return Ok(());
            }
            if inner.run.state != RunState::Running {
                return Ok(());
            }
            let Some(step_id) = inner.compiled.order.get(inner.run.cursor).cloned() else {
                self.finish(slot, inner, EventType::RunCompleted, RunState::Completed)?;
                return Ok(());
            };

            if inner.run.skipped.contains(&step_id)
                || !is_ready(&inner.run, &inner.compiled, &step_id)
            {
                // Unsatisfied routes cascade: downstream steps see this one
                // as never executed.
                inner.run.skipped.insert(step_id);
                inner.run.cursor += 1;
                continue;
            }

            let step = inner
                .compiled
                .step(&step_id)
                .expect("compiled order only contains validated steps")
                .clone();

            match &step.kind {
                StepKind::Human { .. } => {
                    inner.run.current_step = Some(step_id.clone());
                    self.append_run_event(
                        &inner.run,
                        EventType::RunPaused,
                        json!({ "at_step": step_id }),
                    )?;
                    inner.run.state = RunState::PausedForUser;
                    self.publish(slot, &inner.run);
                    // Cursor stays on the checkpoint; resume moves past it.
                    return Ok(());
                }
                StepKind::Logic(LogicKind::IfElse {
                    condition,
                    then_route,
                    else_route,
                }) => {
                    let chosen = if condition.evaluate(&inner.run.payload) {
                        then_route.clone()
                    } else {
                        else_route.clone()
                    };
                    inner.run.route_choices.insert(step_id.clone(), chosen.clone());
                    inner.run.executed.insert(step_id.clone());
                    self.append_run_event(
                        &inner.run,
                        EventType::StepCompleted,
                        json!({ "step_id": step_id, "chosen_route": chosen, "output": {} }),
                    )?;
                    self.publish(slot, &inner.run);
                }
                StepKind::Logic(LogicKind::Loop {
                    body,
                    max_iterations,
                    until,
                }) => {
                    let body = body.clone();
                    let until = until.clone();
                    let max = *max_iterations;
                    match self
                        .run_loop(slot, inner, &step_id, &body, max, until.as_ref())
                        .await?
                    {
                        StepFlow::Applied => {}
                        StepFlow::Terminal => return Ok(()),
                    }
                }
                _ => {
                    let result = self.run_handler(&inner.run, &step).await;
                    if slot.cancel.load(Ordering::SeqCst) {
                        // The run was cancelled while the call was in
                        // flight; its result must be discarded.
                        self.finish(slot, inner, EventType::RunCancelled, RunState::Cancelled)?;
                        return Ok(());
                    }
                    match result {
                        Ok(outcome) => {
                            match self
                                .apply_outcome(slot, inner, &step_id, outcome, None)
                                .await?
                            {
                                StepFlow::Applied => {}
                                StepFlow::Terminal => return Ok(()),
                            }
                        }
                        Err(err) => {
                            self.fail_step(slot, inner, &step_id, &err)?;
                            return Ok(());
                        }
                    }
                }
            }
            inner.run.cursor += 1;
        }
    }

    /// Drive one loop step: repeat the body until the condition holds or
    /// the hard iteration ceiling is reached.
    async fn run_loop(
        &self,
        slot: &RunSlot,
        inner: &mut RunInner,
        loop_id: &StepId,
        body: &[StepId],
        max_iterations: u32,
        until: Option<&crate::definitions::Condition>,
    ) -> Result<StepFlow, EngineError> {
        let mut iterations = 0u32;
        while iterations < max_iterations {
            if let Some(cond) = until
                && cond.evaluate(&inner.run.payload)
            {
                break;
            }
            for member_id in body {
                let member = inner
                    .compiled
                    .step(member_id)
                    .expect("loop body members are validated")
                    .clone();
                let result = self.run_handler(&inner.run, &member).await;
                if slot.cancel.load(Ordering::SeqCst) {
                    self.finish(slot, inner, EventType::RunCancelled, RunState::Cancelled)?;
                    return Ok(StepFlow::Terminal);
                }
                match result {
                    Ok(outcome) => {
                        match self
                            .apply_outcome(slot, inner, member_id, outcome, Some(iterations))
                            .await?
                        {
                            StepFlow::Applied => {}
                            StepFlow::Terminal => return Ok(StepFlow::Terminal),
                        }
                    }
                    Err(err) => {
                        self.fail_step(slot, inner, member_id, &err)?;
                        return Ok(StepFlow::Terminal);
                    }
                }
            }
            iterations += 1;
        }
        inner.run.executed.insert(loop_id.clone());
        self.append_run_event(
            &inner.run,
            EventType::StepCompleted,
            json!({ "step_id": loop_id, "iterations": iterations, "output": {} }),
        )?;
        self.publish(slot, &inner.run);
        Ok(StepFlow::Applied)
    }

    /// Dispatch one non-suspending, non-routing step to its category
    /// handler. Dispatch is by variant tag; the kinds handled directly in
    /// the advance loop never reach here.
    async fn run_handler(&self, run: &Run, step: &Step) -> Result<StepOutcome, StepError> {
        match &step.kind {
            StepKind::Context { subjects, into } => {
                run_context(&step.id, subjects, into, self.entities.as_ref()).await
            }
            StepKind::Transform(spec) => run_transform(&step.id, spec, &run.payload),
            StepKind::Execute(spec) => {
                let model = self.resolve_model_for(run, &step.id, spec).await?;
                run_execute(&step.id, spec, &model, &run.payload, self.generation.as_ref()).await
            }
            StepKind::Logic(LogicKind::MergeOutputs {
                sources,
                into,
                combinator,
            }) => run_merge_outputs(&step.id, sources, into, *combinator, &run.payload),
            StepKind::Human { .. } | StepKind::Logic(_) => {
                unreachable!("human and routing steps are dispatched by the advance loop")
            }
        }
    }

    /// Model resolution cascade for an Execute step: resume-time override →
    /// step override → subject preference → category default → engine
    /// default, first non-empty wins.
    async fn resolve_model_for(
        &self,
        run: &Run,
        step_id: &StepId,
        spec: &ExecuteSpec,
    ) -> Result<ModelConfig, StepError> {
        let step_override = run
            .step_overrides
            .get(step_id)
            .or(spec.model_override.as_ref());
        let subject_preference = match &spec.subject {
            Some(subject) => self
                .entities
                .get(subject)
                .await?
                .as_ref()
                .and_then(subject_model_preference),
            None => None,
        };
        Ok(resolve_model(
            step_override,
            subject_preference.as_ref(),
            self.config.category_models.get(&StepCategory::Execute),
            &self.config.default_model,
        ))
    }

    /// Persist a successful outcome: subject writes first (each recorded as
    /// `SubjectUpdated`), then the payload merge and `StepCompleted` fact.
    async fn apply_outcome(
        &self,
        slot: &RunSlot,
        inner: &mut RunInner,
        step_id: &StepId,
        outcome: StepOutcome,
        iteration: Option<u32>,
    ) -> Result<StepFlow, EngineError> {
        for (subject, value) in &outcome.subject_writes {
            if let Err(e) = self.entities.put(subject, value.clone()).await {
                self.fail_step(slot, inner, step_id, &StepError::from(e))?;
                return Ok(StepFlow::Terminal);
            }
            let payload = match value {
                Value::Object(_) => value.clone(),
                other => json!({ "value": other }),
            };
            self.log.append_next(
                inner.run.branch_id,
                EventType::SubjectUpdated,
                subject.clone(),
                payload,
            )?;
        }

        inner.run.merge_payload(&outcome.output);
        inner.run.executed.insert(step_id.clone());
        let mut fact = json!({ "step_id": step_id, "output": outcome.output });
        if let Some(i) = iteration {
            fact["iteration"] = json!(i);
        }
        self.append_run_event(&inner.run, EventType::StepCompleted, fact)?;
        self.publish(slot, &inner.run);
        Ok(StepFlow::Applied)
    }

    fn fail_step(
        &self,
        slot: &RunSlot,
        inner: &mut RunInner,
        step_id: &StepId,
        err: &StepError,
    ) -> Result<(), EngineError> {
        let detail = err.to_string();
        tracing::warn!(run = %inner.run.id, step = %step_id, error = %detail, "step failed");
        inner.run.current_step = Some(step_id.clone());
        inner.run.failure = Some(detail.clone());
        self.append_run_event(
            &inner.run,
            EventType::StepFailed,
            json!({ "step_id": step_id, "error": detail }),
        )?;
        inner.run.state = RunState::Failed;
        self.publish(slot, &inner.run);
        self.retire(inner.run.id, inner.run.branch_id);
        Ok(())
    }

    fn finish(
        &self,
        slot: &RunSlot,
        inner: &mut RunInner,
        event_type: EventType,
        state: RunState,
    ) -> Result<(), EngineError> {
        self.append_run_event(&inner.run, event_type, json!({}))?;
        inner.run.state = state;
        if state == RunState::Completed {
            inner.run.current_step = None;
        }
        self.publish(slot, &inner.run);
        self.retire(inner.run.id, inner.run.branch_id);
        Ok(())
    }

    /// Remove the live slot once the terminal event is persisted; from here
    /// on the run is served by replay.
    fn retire(&self, run: RunId, branch: BranchId) {
        self.active.write().remove(&run);
        self.finished.write().insert(run, branch);
    }

    fn publish(&self, slot: &RunSlot, run: &Run) {
        let view = run.view();
        *slot.view.write() = view.clone();
        self.stream.emit(&view);
    }

    fn append_run_event(
        &self,
        run: &Run,
        event_type: EventType,
        payload: Value,
    ) -> Result<crate::event_log::Event, LogError> {
        self.log.append_next(
            run.branch_id,
            event_type,
            SubjectId::from(format!("run:{}", run.id)),
            payload,
        )
    }
}

/// A step is ready when it has no incoming edges, or at least one incoming
/// edge from an executed step whose condition holds (and, for edges out of
/// an `if_else`, whose route was the chosen one).
fn is_ready(run: &Run, compiled: &CompiledDefinition, step: &StepId) -> bool {
    let incoming = compiled.incoming(step);
    if incoming.is_empty() {
        return true;
    }
    incoming.iter().any(|edge| {
        if !run.executed.contains(&edge.from) {
            return false;
        }
        if let Some(chosen) = run.route_choices.get(&edge.from)
            && chosen != step
        {
            return false;
        }
        edge.condition
            .as_ref()
            .is_none_or(|c| c.evaluate(&run.payload))
    })
}

//! Public control surface of the engine.
//!
//! [`Engine`] wires the event log, definition store, projector, executor,
//! and stream hub together behind one object. Everything a caller can do —
//! definition CRUD, run control, branch operations, projection, streaming
//! subscriptions — goes through here; the constituent parts are not meant
//! to be driven individually outside tests.

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::collaborators::{EntityStore, GenerationService, InMemoryEntityStore};
use crate::config::EngineConfig;
use crate::definitions::{CompiledDefinition, Definition, DefinitionStore};
use crate::event_log::{BranchDiff, BranchSummary, Event, EventLog, LogError};
use crate::projection::{ProjectedState, Projector};
use crate::runs::{EngineError, Executor, ResumePayload, RunView};
use crate::stream::{StreamHub, UpdateSink};
use crate::types::{BranchId, DefinitionId, EventId, RunId, RunState};

/// Staged construction of an [`Engine`].
///
/// The generation service is the one collaborator without a sensible
/// default, so the builder requires it up front; the entity store defaults
/// to the in-memory one.
pub struct EngineBuilder {
    config: EngineConfig,
    generation: Arc<dyn GenerationService>,
    entities: Option<Arc<dyn EntityStore>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn entities(mut self, entities: Arc<dyn EntityStore>) -> Self {
        self.entities = Some(entities);
        self
    }

    #[must_use]
    pub fn build(self) -> Engine {
        let log = Arc::new(EventLog::new());
        let definitions = Arc::new(DefinitionStore::new());
        let projector = Projector::new(log.clone(), self.config.snapshot_interval);
        let stream = Arc::new(StreamHub::new(self.config.stream_buffer));
        let entities = self
            .entities
            .unwrap_or_else(|| Arc::new(InMemoryEntityStore::new()));
        let executor = Executor::new(
            log.clone(),
            definitions.clone(),
            self.generation,
            entities,
            stream.clone(),
            self.config,
        );
        Engine {
            log,
            definitions,
            projector,
            stream,
            executor,
        }
    }
}

/// The assembled engine. See the module docs for the surface overview.
pub struct Engine {
    log: Arc<EventLog>,
    definitions: Arc<DefinitionStore>,
    projector: Projector,
    stream: Arc<StreamHub>,
    executor: Executor,
}

impl Engine {
    #[must_use]
    pub fn builder(generation: Arc<dyn GenerationService>) -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            generation,
            entities: None,
        }
    }

    // Definitions ---------------------------------------------------------

    /// Validate and store a definition. Invalid graphs are rejected here;
    /// no run can ever observe one.
    pub fn create_definition(
        &self,
        definition: Definition,
    ) -> Result<Arc<CompiledDefinition>, EngineError> {
        Ok(self.definitions.create(definition)?)
    }

    /// Validate and replace a stored definition, keeping its id. Runs
    /// already started keep executing against the version they started
    /// with.
    pub fn update_definition(
        &self,
        id: DefinitionId,
        definition: Definition,
    ) -> Result<Arc<CompiledDefinition>, EngineError> {
        self.definitions
            .update(id, definition)?
            .ok_or(EngineError::DefinitionNotFound { definition: id })
    }

    #[must_use]
    pub fn definition(&self, id: DefinitionId) -> Option<Arc<CompiledDefinition>> {
        self.definitions.get(id)
    }

    pub fn delete_definition(&self, id: DefinitionId) -> bool {
        self.definitions.delete(id)
    }

    #[must_use]
    pub fn definitions(&self) -> Vec<Arc<CompiledDefinition>> {
        self.definitions.list()
    }

    // Runs ----------------------------------------------------------------

    /// Start a run: create its branch, record `RUN_CREATED`, and advance
    /// until the first human checkpoint or a terminal state. The returned
    /// view reflects wherever execution came to rest.
    pub async fn start_run(
        &self,
        definition: DefinitionId,
        initial_payload: FxHashMap<String, Value>,
    ) -> Result<RunView, EngineError> {
        self.executor.start(definition, initial_payload).await
    }

    /// Resume a paused run with the caller's edits, overrides, and skip
    /// flags, then advance until the next rest point.
    pub async fn resume_run(
        &self,
        run: RunId,
        resume: ResumePayload,
    ) -> Result<RunView, EngineError> {
        self.executor.resume(run, resume).await
    }

    /// Request cancellation. Takes effect immediately for paused runs, at
    /// the next step boundary for running ones.
    pub async fn cancel_run(&self, run: RunId) -> Result<(), EngineError> {
        self.executor.cancel(run).await
    }

    pub fn run(&self, run: RunId) -> Result<RunView, EngineError> {
        self.executor.get(run)
    }

    pub fn runs(&self, filter_by_state: Option<RunState>) -> Result<Vec<RunView>, EngineError> {
        self.executor.list(filter_by_state)
    }

    // Branches and projection ---------------------------------------------

    /// Fork an alternate timeline whose head is `checkout_event`. O(1);
    /// the source branch is untouched.
    pub fn fork(
        &self,
        source: BranchId,
        checkout_event: EventId,
        name: impl Into<String> + std::fmt::Debug,
    ) -> Result<BranchId, LogError> {
        self.log.fork(source, checkout_event, name)
    }

    #[must_use]
    pub fn branches(&self) -> Vec<BranchSummary> {
        self.log.list_branches()
    }

    /// Full chain of a branch, root→head.
    pub fn branch_events(&self, branch: BranchId) -> Result<Vec<Event>, LogError> {
        self.log.events_for_branch(branch)
    }

    /// Common ancestor plus divergent suffixes of two branches.
    pub fn compare_branches(&self, a: BranchId, b: BranchId) -> Result<BranchDiff, LogError> {
        self.log.compare(a, b)
    }

    /// Materialized subject state implied by a branch's head.
    pub fn project(&self, branch: BranchId) -> Result<ProjectedState, LogError> {
        self.projector.project(branch)
    }

    /// Materialized subject state as of a specific event.
    pub fn project_at(&self, event: EventId) -> Result<ProjectedState, LogError> {
        self.projector.project_at(event)
    }

    // Streaming -----------------------------------------------------------

    /// Subscribe to run snapshots; every transition after this call is
    /// delivered until the receiver is dropped.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<RunView> {
        self.stream.subscribe()
    }

    /// Attach a custom sink to the snapshot stream.
    pub fn add_sink(&self, sink: impl UpdateSink + 'static) {
        self.stream.add_sink(sink);
    }

    /// Direct access to the event log for callers composing their own
    /// appends (the collaborative-editing surface).
    #[must_use]
    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }
}

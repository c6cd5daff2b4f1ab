use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use std::sync::Arc;

use branchloom::collaborators::{
    GenerationError, GenerationService, InMemoryEntityStore, ModelConfig,
};
use branchloom::definitions::{Definition, Edge, Step, StepKind};
use branchloom::engine::Engine;

/// Generation service answering from a fixed FIFO script and recording every
/// call. With an empty script it echoes the prompt.
pub struct ScriptedGeneration {
    responses: Mutex<Vec<Value>>,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedGeneration {
    pub fn new(responses: impl IntoIterator<Item = Value>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn echo() -> Self {
        Self::new([])
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl GenerationService for ScriptedGeneration {
    async fn generate(&self, prompt: &str, model: &ModelConfig) -> Result<Value, GenerationError> {
        self.calls
            .lock()
            .push((prompt.to_string(), model.name.clone()));
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            Ok(json!(format!("echo: {prompt}")))
        } else {
            Ok(responses.remove(0))
        }
    }
}

/// Generation service that always fails.
pub struct FailingGeneration;

#[async_trait]
impl GenerationService for FailingGeneration {
    async fn generate(&self, _prompt: &str, model: &ModelConfig) -> Result<Value, GenerationError> {
        Err(GenerationError::Provider {
            model: model.name.clone(),
            message: "scripted failure".into(),
        })
    }
}

pub fn engine_with(
    generation: Arc<dyn GenerationService>,
    entities: Arc<InMemoryEntityStore>,
) -> Engine {
    Engine::builder(generation).entities(entities).build()
}

pub fn seeded_entities() -> Arc<InMemoryEntityStore> {
    let entities = Arc::new(InMemoryEntityStore::new());
    entities.seed("dossier", json!({"title": "Q3 launch"}));
    entities
}

/// Linear review workflow: gather context, pause for approval, then draft.
pub fn review_definition() -> Definition {
    Definition::builder("review")
        .step(Step::new("gather", StepKind::context(["dossier"], "research")))
        .step(Step::new("approve", StepKind::human()))
        .step(Step::new(
            "draft",
            StepKind::generate("Draft a note about {research}", "draft"),
        ))
        .edge(Edge::new("gather", "approve"))
        .edge(Edge::new("approve", "draft"))
        .build()
}

/// Same workflow without the human checkpoint.
pub fn straight_definition() -> Definition {
    Definition::builder("straight")
        .step(Step::new("gather", StepKind::context(["dossier"], "research")))
        .step(Step::new(
            "draft",
            StepKind::generate("Draft a note about {research}", "draft"),
        ))
        .edge(Edge::new("gather", "draft"))
        .build()
}

pub fn payload(pairs: &[(&str, Value)]) -> FxHashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

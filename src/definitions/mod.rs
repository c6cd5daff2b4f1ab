//! Workflow definitions: typed steps, edges, and conditions.
//!
//! A [`Definition`] is a directed acyclic graph of [`Step`]s connected by
//! [`Edge`]s. Step behavior is a closed sum ([`StepKind`]) across five
//! categories: context-gathering, pure transforms, human checkpoints,
//! effectful execution, and branching logic. Because definitions are data
//! (created and edited by external callers), routing conditions are
//! serializable [`Condition`] values evaluated against the run payload, not
//! opaque closures.
//!
//! Definitions are validated once at save time ([`validate::CompiledDefinition`]);
//! a run never encounters a malformed graph.

pub mod store;
pub mod validate;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collaborators::ModelConfig;
use crate::steps::StepCategory;
use crate::types::{DefinitionId, StepId, SubjectId};

pub use store::DefinitionStore;
pub use validate::{CompiledDefinition, ValidationError};

/// A workflow definition: steps plus the edges connecting them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Definition {
    pub id: DefinitionId,
    pub name: String,
    pub steps: Vec<Step>,
    pub edges: Vec<Edge>,
}

impl Definition {
    /// Start building a definition with a fluent API.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> DefinitionBuilder {
        DefinitionBuilder {
            name: name.into(),
            steps: Vec::new(),
            edges: Vec::new(),
        }
    }
}

/// Builder for [`Definition`]. Produces an unvalidated definition; graph
/// well-formedness is checked when the definition is saved.
#[derive(Debug)]
pub struct DefinitionBuilder {
    name: String,
    steps: Vec<Step>,
    edges: Vec<Edge>,
}

impl DefinitionBuilder {
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    #[must_use]
    pub fn build(self) -> Definition {
        Definition {
            id: DefinitionId::new(),
            name: self.name,
            steps: self.steps,
            edges: self.edges,
        }
    }
}

/// One step of a workflow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub kind: StepKind,
}

impl Step {
    #[must_use]
    pub fn new(id: impl Into<StepId>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Closed sum of step behaviors. Dispatch is resolved by variant tag at
/// validation time; the executor never matches on strings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Read subjects from the entity store into the payload. No writes.
    Context {
        subjects: Vec<SubjectId>,
        /// Payload key receiving the gathered subjects.
        into: String,
    },
    /// Pure function of the payload. No external I/O.
    Transform(TransformSpec),
    /// Suspend the run pending external input. Carries no handler logic;
    /// reaching one is exactly the pause condition.
    Human { prompt: Option<String> },
    /// Effectful call through a collaborator boundary.
    Execute(ExecuteSpec),
    /// Routing, loops, and fan-in combination.
    Logic(LogicKind),
}

impl StepKind {
    #[must_use]
    pub fn category(&self) -> StepCategory {
        match self {
            Self::Context { .. } => StepCategory::Context,
            Self::Transform(_) => StepCategory::Transform,
            Self::Human { .. } => StepCategory::Human,
            Self::Execute(_) => StepCategory::Execute,
            Self::Logic(_) => StepCategory::Logic,
        }
    }

    /// Context step reading `subjects` into payload key `into`.
    pub fn context<I, S>(subjects: I, into: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SubjectId>,
    {
        Self::Context {
            subjects: subjects.into_iter().map(Into::into).collect(),
            into: into.into(),
        }
    }

    /// Human checkpoint with no prompt text.
    #[must_use]
    pub fn human() -> Self {
        Self::Human { prompt: None }
    }

    /// Execute step invoking the generation service.
    pub fn generate(template: impl Into<String>, into: impl Into<String>) -> Self {
        Self::Execute(ExecuteSpec {
            action: ExecuteAction::Generate {
                prompt_template: template.into(),
                into: into.into(),
            },
            model_override: None,
            subject: None,
        })
    }

    /// Execute step persisting a payload key to the entity store.
    pub fn persist(subject: impl Into<SubjectId>, from: impl Into<String>) -> Self {
        Self::Execute(ExecuteSpec {
            action: ExecuteAction::PersistSubject {
                subject: subject.into(),
                from: from.into(),
            },
            model_override: None,
            subject: None,
        })
    }
}

/// Pure payload transforms.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformSpec {
    /// Substitute `{key}` placeholders from the payload into `template`.
    RenderTemplate { template: String, into: String },
    /// Fan out the value at `from` into `variants` labeled copies under
    /// `into`; variants are produced internally and joined before the next
    /// step (no intra-run parallelism escapes the step).
    FanOut {
        from: String,
        variants: u32,
        into: String,
    },
    /// Gather several payload keys into one object under `into`.
    MergeKeys { sources: Vec<String>, into: String },
}

/// Execute step configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteSpec {
    pub action: ExecuteAction,
    /// Step-level model override, the highest-priority rung of the
    /// resolution cascade.
    pub model_override: Option<ModelConfig>,
    /// Subject whose stored `model_preference` participates in the cascade.
    pub subject: Option<SubjectId>,
}

/// Effectful actions an Execute step can perform.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ExecuteAction {
    /// Call the generation service with a rendered prompt; store the result
    /// under payload key `into`.
    Generate {
        prompt_template: String,
        into: String,
    },
    /// Write the payload value at `from` to the entity store under
    /// `subject`, recording a `SubjectUpdated` event.
    PersistSubject { subject: SubjectId, from: String },
}

/// Logic steps: routing, bounded loops, fan-in combination.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "logic", rename_all = "snake_case")]
pub enum LogicKind {
    /// Route to exactly one of two successors based on the payload.
    IfElse {
        condition: Condition,
        then_route: StepId,
        else_route: StepId,
    },
    /// Repeat a bounded body until `until` holds or `max_iterations` is
    /// reached. The hard ceiling guarantees termination and is required at
    /// validation time.
    Loop {
        body: Vec<StepId>,
        max_iterations: u32,
        until: Option<Condition>,
    },
    /// Combine payload fragments from converging upstream edges.
    MergeOutputs {
        sources: Vec<String>,
        into: String,
        #[serde(default)]
        combinator: MergeCombinator,
    },
}

/// How `merge_outputs` combines its source values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeCombinator {
    /// Last-writer-wins per key across object fragments (the default).
    #[default]
    LastWins,
    /// Collect source values into an array in source order.
    Collect,
    /// Concatenate string values in source order.
    Concat,
}

/// An edge between two steps, optionally gated by a condition on the
/// payload. A step runs once all of its satisfied incoming edges have
/// completed; a step whose incoming edges are all unsatisfied is skipped.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Edge {
    pub from: StepId,
    pub to: StepId,
    pub condition: Option<Condition>,
}

impl Edge {
    #[must_use]
    pub fn new(from: impl Into<StepId>, to: impl Into<StepId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    #[must_use]
    pub fn when(from: impl Into<StepId>, to: impl Into<StepId>, condition: Condition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: Some(condition),
        }
    }
}

/// Serializable boolean expression over the run payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "cond", rename_all = "snake_case")]
pub enum Condition {
    /// Key is present (any value, including null).
    Exists { key: String },
    /// Key is present and truthy (not null, false, 0, "", [], {}).
    Truthy { key: String },
    Eq { key: String, value: Value },
    Ne { key: String, value: Value },
    Not { inner: Box<Condition> },
    All { terms: Vec<Condition> },
    Any { terms: Vec<Condition> },
}

impl Condition {
    /// Shorthand for `Truthy`.
    pub fn truthy(key: impl Into<String>) -> Self {
        Self::Truthy { key: key.into() }
    }

    /// Shorthand for `Eq`.
    pub fn eq(key: impl Into<String>, value: Value) -> Self {
        Self::Eq {
            key: key.into(),
            value,
        }
    }

    /// Evaluate against a payload map.
    #[must_use]
    pub fn evaluate(&self, payload: &FxHashMap<String, Value>) -> bool {
        match self {
            Self::Exists { key } => payload.contains_key(key),
            Self::Truthy { key } => payload.get(key).is_some_and(is_truthy),
            Self::Eq { key, value } => payload.get(key) == Some(value),
            Self::Ne { key, value } => payload.get(key) != Some(value),
            Self::Not { inner } => !inner.evaluate(payload),
            Self::All { terms } => terms.iter().all(|t| t.evaluate(payload)),
            Self::Any { terms } => terms.iter().any(|t| t.evaluate(payload)),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(pairs: &[(&str, Value)]) -> FxHashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn condition_evaluation() {
        let p = payload(&[("approved", json!(true)), ("count", json!(0))]);
        assert!(Condition::truthy("approved").evaluate(&p));
        assert!(!Condition::truthy("count").evaluate(&p));
        assert!(Condition::Exists { key: "count".into() }.evaluate(&p));
        assert!(Condition::eq("count", json!(0)).evaluate(&p));
        assert!(
            Condition::All {
                terms: vec![
                    Condition::truthy("approved"),
                    Condition::Not {
                        inner: Box::new(Condition::truthy("count"))
                    },
                ]
            }
            .evaluate(&p)
        );
    }

    #[test]
    fn condition_round_trips_through_json() {
        let cond = Condition::Any {
            terms: vec![Condition::eq("state", json!("ok")), Condition::truthy("force")],
        };
        let raw = serde_json::to_string(&cond).unwrap();
        let back: Condition = serde_json::from_str(&raw).unwrap();
        let p = payload(&[("force", json!(1))]);
        assert_eq!(cond.evaluate(&p), back.evaluate(&p));
    }
}

//! Handlers for context, transform, execute, and merge steps.
//!
//! Handlers are free functions: the executor owns dispatch (the step kind is
//! a closed sum resolved at validation time) and calls the matching handler
//! with exactly the inputs its contract allows. Context and Execute get
//! collaborator access; Transform and merge see only the payload.

use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tracing::debug;

use crate::collaborators::{EntityStore, GenerationService, ModelConfig};
use crate::definitions::{ExecuteAction, ExecuteSpec, MergeCombinator, TransformSpec};
use crate::types::{StepId, SubjectId};

use super::{StepError, StepOutcome};

/// Context step: read each subject from the entity store into one object
/// under the `into` key. Read-only.
pub async fn run_context(
    step: &StepId,
    subjects: &[SubjectId],
    into: &str,
    entities: &dyn EntityStore,
) -> Result<StepOutcome, StepError> {
    let mut gathered = serde_json::Map::new();
    for subject in subjects {
        let value = entities
            .get(subject)
            .await?
            .ok_or_else(|| StepError::MissingSubject {
                step: step.clone(),
                subject: subject.clone(),
            })?;
        gathered.insert(subject.to_string(), value);
    }
    Ok(StepOutcome::with_output(into, Value::Object(gathered)))
}

/// Transform step: pure function of the payload.
pub fn run_transform(
    step: &StepId,
    spec: &TransformSpec,
    payload: &FxHashMap<String, Value>,
) -> Result<StepOutcome, StepError> {
    match spec {
        TransformSpec::RenderTemplate { template, into } => {
            let rendered = render_template(template, payload);
            Ok(StepOutcome::with_output(into, Value::String(rendered)))
        }
        TransformSpec::FanOut {
            from,
            variants,
            into,
        } => {
            let source = required(step, payload, from)?;
            // Variants are produced inside the step and joined here; nothing
            // escapes before the next step sees the full set.
            let fanned: Vec<Value> = (0..*variants)
                .map(|i| json!({ "variant": i, "value": source.clone() }))
                .collect();
            Ok(StepOutcome::with_output(into, Value::Array(fanned)))
        }
        TransformSpec::MergeKeys { sources, into } => {
            let mut merged = serde_json::Map::new();
            for key in sources {
                merged.insert(key.clone(), required(step, payload, key)?.clone());
            }
            Ok(StepOutcome::with_output(into, Value::Object(merged)))
        }
    }
}

/// Execute step: effectful call through a collaborator boundary with a
/// resolved model configuration.
pub async fn run_execute(
    step: &StepId,
    spec: &ExecuteSpec,
    model: &ModelConfig,
    payload: &FxHashMap<String, Value>,
    generation: &dyn GenerationService,
) -> Result<StepOutcome, StepError> {
    match &spec.action {
        ExecuteAction::Generate {
            prompt_template,
            into,
        } => {
            let prompt = render_template(prompt_template, payload);
            debug!(step = %step, model = %model.name, "invoking generation service");
            let result = generation.generate(&prompt, model).await?;
            Ok(StepOutcome::with_output(into, result))
        }
        ExecuteAction::PersistSubject { subject, from } => {
            let value = required(step, payload, from)?.clone();
            let mut outcome = StepOutcome::with_output(from, value.clone());
            outcome.subject_writes.push((subject.clone(), value));
            Ok(outcome)
        }
    }
}

/// `merge_outputs` logic step: combine converging payload fragments.
pub fn run_merge_outputs(
    step: &StepId,
    sources: &[String],
    into: &str,
    combinator: MergeCombinator,
    payload: &FxHashMap<String, Value>,
) -> Result<StepOutcome, StepError> {
    let combined = match combinator {
        MergeCombinator::LastWins => {
            let mut merged = serde_json::Map::new();
            for key in sources {
                match required(step, payload, key)? {
                    Value::Object(fields) => {
                        for (k, v) in fields {
                            merged.insert(k.clone(), v.clone());
                        }
                    }
                    other => {
                        merged.insert(key.clone(), other.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        MergeCombinator::Collect => Value::Array(
            sources
                .iter()
                .map(|key| required(step, payload, key).cloned())
                .collect::<Result<_, _>>()?,
        ),
        MergeCombinator::Concat => {
            let mut out = String::new();
            for key in sources {
                match required(step, payload, key)? {
                    Value::String(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                }
            }
            Value::String(out)
        }
    };
    Ok(StepOutcome::with_output(into, combined))
}

/// Substitute `{key}` placeholders with payload values. Strings are
/// inserted verbatim, everything else as compact JSON; unknown keys are
/// left in place so the gap is visible downstream.
#[must_use]
pub fn render_template(template: &str, payload: &FxHashMap<String, Value>) -> String {
    let mut out = template.to_string();
    for (key, value) in payload {
        let placeholder = format!("{{{key}}}");
        if out.contains(&placeholder) {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&placeholder, &rendered);
        }
    }
    out
}

fn required<'a>(
    step: &StepId,
    payload: &'a FxHashMap<String, Value>,
    key: &str,
) -> Result<&'a Value, StepError> {
    payload.get(key).ok_or_else(|| StepError::MissingInput {
        step: step.clone(),
        key: key.to_string(),
    })
}

//! Model resolution cascade.
//!
//! Execute steps resolve their model configuration through an ordered list
//! of resolvers, first non-empty result wins:
//!
//! 1. step-level override (on the step or supplied at resume time)
//! 2. subject-level preference (a `model_preference` field on the subject)
//! 3. category default from engine config
//! 4. engine-wide default
//!
//! The cascade is a generic first-match combinator over resolver functions
//! rather than a nested conditional chain, so adding a rung is a one-line
//! change at the call site.

use serde_json::Value;

use crate::collaborators::ModelConfig;

/// A single rung of the cascade.
pub type ModelResolver<'a> = Box<dyn Fn() -> Option<ModelConfig> + 'a>;

/// Evaluate resolvers in order; the first `Some` wins.
pub fn first_match<'a>(resolvers: impl IntoIterator<Item = ModelResolver<'a>>) -> Option<ModelConfig> {
    resolvers.into_iter().find_map(|r| r())
}

/// Resolve a model through the standard four-rung cascade. The engine
/// default makes the result total.
#[must_use]
pub fn resolve_model(
    step_override: Option<&ModelConfig>,
    subject_preference: Option<&ModelConfig>,
    category_default: Option<&ModelConfig>,
    engine_default: &ModelConfig,
) -> ModelConfig {
    first_match([
        Box::new(|| step_override.cloned()) as ModelResolver<'_>,
        Box::new(|| subject_preference.cloned()),
        Box::new(|| category_default.cloned()),
    ])
    .unwrap_or_else(|| engine_default.clone())
}

/// Extract a subject's stored model preference, if any.
///
/// A subject opts in by carrying a `model_preference` field that
/// deserializes to a [`ModelConfig`]; anything else is ignored.
#[must_use]
pub fn subject_model_preference(subject_state: &Value) -> Option<ModelConfig> {
    subject_state
        .get("model_preference")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

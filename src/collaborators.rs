//! External collaborator boundaries: generation service and entity store.
//!
//! The engine treats natural-language generation as an opaque call
//! `(prompt, model) -> structured result` that may fail, and the entity
//! store as a key-value surface addressable by stable subject ids. Both are
//! trait objects injected at engine construction; the in-memory entity store
//! here is the default used by tests and local development.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::SubjectId;

/// Resolved model configuration handed to the generation service.
///
/// Produced by the resolution cascade in [`crate::steps::resolve`]; the
/// engine never interprets `params`, it is passed through opaquely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider label (e.g. a vendor or routing key). Opaque to the engine.
    pub provider: Option<String>,
    /// Model name within the provider.
    pub name: String,
}

impl ModelConfig {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            provider: None,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

/// Errors surfaced by a generation service call.
///
/// The engine never retries these automatically; they become step failures
/// and transition the run to `Failed`.
#[derive(Debug, Error, Diagnostic)]
pub enum GenerationError {
    #[error("generation provider error ({model}): {message}")]
    #[diagnostic(
        code(branchloom::collaborators::provider),
        help("The generation service is a black box; surface the failure and restart the run explicitly.")
    )]
    Provider { model: String, message: String },

    #[error("generation response was not valid JSON: {source}")]
    #[diagnostic(code(branchloom::collaborators::malformed_response))]
    Malformed {
        #[source]
        source: serde_json::Error,
    },
}

/// Opaque natural-language generation boundary.
///
/// Callers supply a rendered prompt and a resolved [`ModelConfig`] and get
/// back text or structured JSON. The call must never be assumed
/// synchronous-fast.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, prompt: &str, model: &ModelConfig) -> Result<Value, GenerationError>;
}

/// Errors surfaced by entity store reads and writes.
#[derive(Debug, Error, Diagnostic)]
pub enum EntityStoreError {
    #[error("entity store backend error: {message}")]
    #[diagnostic(code(branchloom::collaborators::entity_store))]
    Backend { message: String },
}

/// Store of named subjects addressable by stable id.
///
/// Context steps read from it, Execute steps may write to it. The engine
/// does not define the store's schema.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, subject: &SubjectId) -> Result<Option<Value>, EntityStoreError>;
    async fn put(&self, subject: &SubjectId, value: Value) -> Result<(), EntityStoreError>;
}

/// Volatile entity store for tests and local development.
#[derive(Default)]
pub struct InMemoryEntityStore {
    entries: RwLock<FxHashMap<SubjectId, Value>>,
}

impl InMemoryEntityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a subject synchronously; convenient in test setup.
    pub fn seed(&self, subject: impl Into<SubjectId>, value: Value) {
        self.entries.write().insert(subject.into(), value);
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get(&self, subject: &SubjectId) -> Result<Option<Value>, EntityStoreError> {
        Ok(self.entries.read().get(subject).cloned())
    }

    async fn put(&self, subject: &SubjectId, value: Value) -> Result<(), EntityStoreError> {
        self.entries.write().insert(subject.clone(), value);
        Ok(())
    }
}

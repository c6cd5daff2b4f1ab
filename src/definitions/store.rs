//! Definition CRUD store.
//!
//! Definitions are validated on every write; the store only ever holds
//! [`CompiledDefinition`]s, so a run can never be started from a malformed
//! graph.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::types::DefinitionId;

use super::validate::{CompiledDefinition, ValidationError};
use super::Definition;

#[derive(Default)]
pub struct DefinitionStore {
    inner: RwLock<FxHashMap<DefinitionId, Arc<CompiledDefinition>>>,
}

impl DefinitionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a new definition.
    pub fn create(&self, definition: Definition) -> Result<Arc<CompiledDefinition>, ValidationError> {
        let compiled = Arc::new(CompiledDefinition::compile(definition)?);
        self.inner
            .write()
            .insert(compiled.definition.id, compiled.clone());
        Ok(compiled)
    }

    /// Validate and replace an existing definition. Returns `None` when the
    /// id is unknown; the replacement keeps the original id.
    pub fn update(
        &self,
        id: DefinitionId,
        mut definition: Definition,
    ) -> Result<Option<Arc<CompiledDefinition>>, ValidationError> {
        definition.id = id;
        let compiled = Arc::new(CompiledDefinition::compile(definition)?);
        let mut inner = self.inner.write();
        if !inner.contains_key(&id) {
            return Ok(None);
        }
        inner.insert(id, compiled.clone());
        Ok(Some(compiled))
    }

    #[must_use]
    pub fn get(&self, id: DefinitionId) -> Option<Arc<CompiledDefinition>> {
        self.inner.read().get(&id).cloned()
    }

    /// Remove a definition; returns whether it existed. Runs already started
    /// from it are unaffected (they hold their own `Arc`).
    pub fn delete(&self, id: DefinitionId) -> bool {
        self.inner.write().remove(&id).is_some()
    }

    #[must_use]
    pub fn list(&self) -> Vec<Arc<CompiledDefinition>> {
        let mut out: Vec<_> = self.inner.read().values().cloned().collect();
        out.sort_by(|a, b| {
            a.definition
                .name
                .cmp(&b.definition.name)
                .then(a.definition.id.cmp(&b.definition.id))
        });
        out
    }
}

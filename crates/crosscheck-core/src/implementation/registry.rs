//! Implementation registry -- the variants available to a run, keyed by tag.

use std::collections::HashMap;

use super::trait_def::Implementation;
use super::{ImplementationTag, PythonCommand, PythonImplementation, RustCommand, RustImplementation};
use crate::error::{HarnessError, Result};

/// A collection of registered [`Implementation`]s.
#[derive(Default)]
pub struct ImplementationRegistry {
    implementations: HashMap<ImplementationTag, Box<dyn Implementation>>,
}

impl ImplementationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The Rust and Python variants, built from their command settings.
    pub fn standard(rust: RustCommand, python: PythonCommand) -> Self {
        let mut registry = Self::new();
        registry.register(RustImplementation::new(rust));
        registry.register(PythonImplementation::new(python));
        registry
    }

    /// Register an implementation under its own tag, replacing (and
    /// returning) any previous one.
    pub fn register(
        &mut self,
        implementation: impl Implementation + 'static,
    ) -> Option<Box<dyn Implementation>> {
        self.implementations
            .insert(implementation.tag(), Box::new(implementation))
    }

    /// The implementation registered for `tag`.
    pub fn get(&self, tag: ImplementationTag) -> Result<&dyn Implementation> {
        self.implementations
            .get(&tag)
            .map(|b| b.as_ref())
            .ok_or(HarnessError::UnknownImplementation(tag))
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<ImplementationTag> {
        let mut tags: Vec<_> = self.implementations.keys().copied().collect();
        tags.sort();
        tags
    }

    /// Number of registered implementations.
    pub fn len(&self) -> usize {
        self.implementations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.implementations.is_empty()
    }
}

impl std::fmt::Debug for ImplementationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImplementationRegistry")
            .field("implementations", &self.tags())
            .finish()
    }
}

//! Catalog of named loaders
//!
//! Built once at startup and passed to the orchestrator. Registration order
//! is execution order, and a loader can only be registered after the loaders
//! it depends on.

use std::collections::HashMap;
use std::sync::Arc;

use super::loader::Loader;
use super::types::LoaderCapability;
use crate::error::{IngestError, Result};

#[derive(Default)]
pub struct LoaderRegistry {
    loaders: Vec<Arc<dyn Loader>>,
    by_name: HashMap<String, usize>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a loader. Fails without changing the registry if the name is
    /// taken or a dependency is not registered yet.
    pub fn register(&mut self, loader: Arc<dyn Loader>) -> Result<()> {
        let name = loader.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(IngestError::DuplicateLoader(name));
        }
        if let Some(missing) = loader
            .dependencies()
            .iter()
            .find(|dep| !self.by_name.contains_key(dep.as_str()))
        {
            return Err(IngestError::UnknownDependency {
                loader: name,
                dependency: missing.clone(),
            });
        }

        self.by_name.insert(name, self.loaders.len());
        self.loaders.push(loader);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Loader>> {
        self.by_name
            .get(name)
            .and_then(|&idx| self.loaders.get(idx))
            .cloned()
            .ok_or_else(|| IngestError::LoaderNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// All loaders in registration (dependency) order
    pub fn list(&self) -> &[Arc<dyn Loader>] {
        &self.loaders
    }

    pub fn by_capability(&self, capability: LoaderCapability) -> Vec<Arc<dyn Loader>> {
        self.loaders
            .iter()
            .filter(|loader| loader.supports(capability))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

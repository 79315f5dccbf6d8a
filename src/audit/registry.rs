use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use super::Checker;
use super::checks::{AnalysisCheck, CommandCheck, NoticeCheck};

/// Creates a fresh check instance for a batch.
pub type CheckerFactory = Arc<dyn Fn() -> Box<dyn Checker> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no check implementation registered as '{0}'")]
    UnknownImplementation(String),
    #[error("check '{implementation}' declares an invalid parameter schema: {message}")]
    InvalidSchema {
        implementation: String,
        message: String,
    },
}

/// Check implementations keyed by the identifier policies use as `class`.
#[derive(Clone, Default)]
pub struct CheckerRegistry {
    factories: BTreeMap<String, CheckerFactory>,
}

impl CheckerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `analysis`, `command` and `notice` checks.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("analysis", || Box::new(AnalysisCheck));
        registry.register("command", || Box::new(CommandCheck));
        registry.register("notice", || Box::new(NoticeCheck));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Checker> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn instantiate(&self, name: &str) -> Result<Box<dyn Checker>, RegistryError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RegistryError::UnknownImplementation(name.to_string()))?;
        Ok(factory())
    }
}

impl std::fmt::Debug for CheckerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckerRegistry")
            .field("implementations", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

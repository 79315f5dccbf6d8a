//! Auditing a single policy against a target.
//!
//! # Module Structure
//!
//! - `dependency`: Guard evaluation and failure-behaviour reconciliation
//! - `lifecycle`: The per-policy state machine producing an `AuditResponse`
//! - `registry`: Check implementations keyed by identifier
//! - `checks`: Built-in check implementations

pub mod checks;
pub mod dependency;
pub mod lifecycle;
pub mod registry;

pub use checks::{AnalysisCheck, CommandCheck, NoticeCheck};
pub use dependency::{DependencyFailure, DependencyResolver, Resolution};
pub use lifecycle::{AuditLifecycle, LifecycleStage};
pub use registry::{CheckerRegistry, RegistryError};

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

use crate::expression::{Contexts, ExpressionEngine, ExpressionError, state_context};
use crate::models::{DEFAULT_SYNTAX, Diagnostic, Outcome, Policy, Severity};
use crate::target::{Target, TargetError};

// ============================================================================
// Errors
// ============================================================================

/// Failure raised by a check body.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The target cannot support this check; classified as not applicable.
    #[error("target is not compatible with this check: {0}")]
    TargetIncompatible(String),
    /// The policy supplied unusable input; classified as an error.
    #[error("invalid input: {message}")]
    InvalidInput {
        message: String,
        upgrade_hint: Option<String>,
    },
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AuditError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        AuditError::InvalidInput {
            message: message.into(),
            upgrade_hint: None,
        }
    }

    /// Stable name recorded as the `exception_type` token.
    pub fn kind(&self) -> &'static str {
        match self {
            AuditError::TargetIncompatible(_) => "TargetIncompatible",
            AuditError::InvalidInput { .. } => "InvalidInput",
            AuditError::Target(_) => "TargetError",
            AuditError::Expression(_) => "ExpressionError",
            AuditError::Other(_) => "Error",
        }
    }
}

// ============================================================================
// Batch Cache
// ============================================================================

/// Memoized values shared by the policies of one batch.
#[derive(Debug, Default)]
pub struct BatchCache {
    entries: HashMap<String, Value>,
}

impl BatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Audit Context
// ============================================================================

/// Everything a check body can see and record while it runs.
pub struct AuditContext<'a> {
    policy: &'a Policy,
    target: &'a dyn Target,
    engine: &'a dyn ExpressionEngine,
    cache: &'a mut BatchCache,
    parameters: Contexts,
    tokens: BTreeMap<String, Value>,
    severity: Severity,
}

impl<'a> AuditContext<'a> {
    pub fn new(
        policy: &'a Policy,
        target: &'a dyn Target,
        engine: &'a dyn ExpressionEngine,
        cache: &'a mut BatchCache,
        parameters: Contexts,
    ) -> Self {
        Self {
            policy,
            target,
            engine,
            cache,
            parameters,
            tokens: BTreeMap::new(),
            severity: policy.severity,
        }
    }

    pub fn policy(&self) -> &Policy {
        self.policy
    }

    pub fn target(&self) -> &dyn Target {
        self.target
    }

    pub fn parameters(&self) -> &Contexts {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn parameter_str(&self, name: &str) -> Option<&str> {
        self.parameter(name).and_then(Value::as_str)
    }

    pub fn parameter_bool(&self, name: &str) -> bool {
        self.parameter(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// A string parameter the check cannot run without.
    pub fn require_str(&self, name: &str) -> Result<&str, AuditError> {
        self.parameter_str(name).ok_or_else(|| {
            AuditError::invalid_input(format!("missing string parameter '{}'", name))
        })
    }

    /// Record a diagnostic token on the response.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.tokens.insert(key.into(), value.into());
    }

    pub fn token(&self, key: &str) -> Option<&Value> {
        self.tokens.get(key)
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Raise the response severity. Lower values are ignored.
    pub fn escalate_severity(&mut self, severity: Severity) {
        self.severity = self.severity.max(severity);
    }

    pub fn cache(&mut self) -> &mut BatchCache {
        &mut *self.cache
    }

    /// Contexts for expressions: target, state names, policy, parameters
    /// (also at top level) and tokens recorded so far.
    pub fn contexts(&self) -> Contexts {
        let mut contexts = Contexts::new();
        for (key, value) in &self.parameters {
            contexts.insert(key.clone(), value.clone());
        }
        for (key, value) in &self.tokens {
            contexts.insert(key.clone(), value.clone());
        }
        contexts.insert("parameters".to_string(), Value::Object(self.parameters.clone()));
        contexts.insert("target".to_string(), self.target.properties());
        contexts.insert("state".to_string(), state_context());
        contexts.insert(
            "policy".to_string(),
            json!({
                "name": self.policy.name,
                "title": self.policy.title,
                "severity": self.policy.severity.name(),
            }),
        );
        contexts
    }

    pub fn evaluate(&self, expression: &str) -> Result<Value, AuditError> {
        self.evaluate_with(expression, DEFAULT_SYNTAX)
    }

    pub fn evaluate_with(&self, expression: &str, syntax: &str) -> Result<Value, AuditError> {
        Ok(self.engine.evaluate(expression, syntax, &self.contexts())?)
    }

    pub fn interpolate(&self, template: &str) -> Result<String, AuditError> {
        Ok(self.engine.interpolate(template, &self.contexts())?)
    }

    /// Run a command on the target once per batch; later calls reuse the output.
    pub async fn execute_cached(&mut self, command: &str) -> Result<String, AuditError> {
        let key = format!("command:{}", command);
        if let Some(Value::String(output)) = self.cache.get(&key) {
            return Ok(output.clone());
        }
        let output = self.target.execute(command).await?;
        self.cache.insert(key, Value::String(output.clone()));
        Ok(output)
    }

    pub(crate) fn into_parts(self) -> (BTreeMap<String, Value>, Severity) {
        (self.tokens, self.severity)
    }
}

// ============================================================================
// Checker
// ============================================================================

/// How a policy should be scheduled within its batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    /// Run on its own
    Individual,
    /// Run together with every policy sharing the key
    Group(String),
    /// Do not run; record the diagnostic instead
    Skip(Diagnostic),
}

/// A pluggable check implementation.
///
/// One instance is created per batch and runs each of the batch's policies in
/// turn; anything worth sharing between them belongs in the [`BatchCache`].
#[async_trait]
pub trait Checker: Send + Sync {
    /// Implementation identifier policies refer to via `class`
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Target capabilities this check needs
    fn required_capabilities(&self) -> &[&'static str] {
        &[]
    }

    /// JSON Schema for the policy parameters
    fn parameter_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    fn prepare(&self, _policy: &Policy) -> Prepared {
        Prepared::Individual
    }

    async fn run(&self, ctx: &mut AuditContext<'_>) -> Result<Outcome, AuditError>;
}

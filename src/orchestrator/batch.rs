use jsonschema::Validator;
use serde_json::Value;
use tracing::debug;

use crate::audit::{AuditLifecycle, BatchCache, Checker, CheckerRegistry, Prepared, RegistryError};
use crate::expression::Contexts;
use crate::models::{AuditResponse, Diagnostic, Policy};
use crate::target::Target;

/// Policies sharing one check implementation.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    implementation: String,
    policies: Vec<Policy>,
}

impl Batch {
    /// Group policies by implementation. Batches appear in the order their
    /// implementation is first seen; policies keep their relative order.
    pub fn partition(policies: &[Policy]) -> Vec<Batch> {
        let mut batches: Vec<Batch> = Vec::new();
        for policy in policies {
            match batches
                .iter_mut()
                .find(|b| b.implementation == policy.class)
            {
                Some(batch) => batch.policies.push(policy.clone()),
                None => batches.push(Batch {
                    implementation: policy.class.clone(),
                    policies: vec![policy.clone()],
                }),
            }
        }
        batches
    }

    pub fn implementation(&self) -> &str {
        &self.implementation
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Instantiate the implementation once and compile its parameter schema.
    pub fn bind(&self, registry: &CheckerRegistry) -> Result<BoundBatch, Diagnostic> {
        let checker = registry
            .instantiate(&self.implementation)
            .map_err(registry_diagnostic)?;
        let schema = checker.parameter_schema();
        let validator = jsonschema::validator_for(&schema).map_err(|e| {
            registry_diagnostic(RegistryError::InvalidSchema {
                implementation: self.implementation.clone(),
                message: e.to_string(),
            })
        })?;
        debug!(
            implementation = %self.implementation,
            policies = self.policies.len(),
            "batch bound"
        );
        Ok(BoundBatch {
            checker,
            schema,
            validator,
            cache: BatchCache::new(),
        })
    }
}

fn registry_diagnostic(error: RegistryError) -> Diagnostic {
    let kind = match &error {
        RegistryError::UnknownImplementation(_) => "UnknownImplementation",
        RegistryError::InvalidSchema { .. } => "InvalidSchema",
    };
    Diagnostic::error(kind, error.to_string())
}

/// A batch with its check instance, schema validator and shared cache.
pub struct BoundBatch {
    checker: Box<dyn Checker>,
    schema: Value,
    validator: Validator,
    cache: BatchCache,
}

impl BoundBatch {
    pub fn checker(&self) -> &dyn Checker {
        self.checker.as_ref()
    }

    pub fn prepare(&self, policy: &Policy) -> Prepared {
        self.checker.prepare(policy)
    }

    /// Policy parameters with schema defaults filled in, validated against
    /// the schema.
    pub fn parameters(&self, policy: &Policy) -> Result<Contexts, Diagnostic> {
        let mut parameters = policy.parameters.clone();
        if let Some(properties) = self.schema.get("properties").and_then(Value::as_object) {
            for (name, property) in properties {
                if let Some(default) = property.get("default") {
                    parameters
                        .entry(name.clone())
                        .or_insert_with(|| default.clone());
                }
            }
        }

        let instance = Value::Object(parameters);
        let errors: Vec<String> = self
            .validator
            .iter_errors(&instance)
            .map(|e| e.to_string())
            .collect();
        if !errors.is_empty() {
            return Err(Diagnostic::error(
                "InvalidInput",
                format!("invalid parameters: {}", errors.join("; ")),
            )
            .with_token("validation_errors", errors));
        }

        match instance {
            Value::Object(parameters) => Ok(parameters),
            _ => Ok(Contexts::new()),
        }
    }

    /// Audit one policy of this batch.
    pub async fn audit(
        &mut self,
        policy: &Policy,
        target: &dyn Target,
        lifecycle: &AuditLifecycle<'_>,
    ) -> AuditResponse {
        if let Prepared::Skip(diagnostic) = self.checker.prepare(policy) {
            debug!(policy = %policy.name, "policy skipped by prepare");
            return lifecycle.conclude(policy, diagnostic);
        }

        let parameters = match self.parameters(policy) {
            Ok(parameters) => parameters,
            Err(diagnostic) => return lifecycle.conclude(policy, diagnostic),
        };

        lifecycle
            .execute_with_parameters(
                policy,
                target,
                self.checker.as_ref(),
                &mut self.cache,
                parameters,
            )
            .await
    }
}

//! Dependency resolution.
//!
//! Each dependency is interpolated, evaluated, and counted as failed when the
//! result is not strictly truthy or the evaluation errors. Conflicting
//! behaviours of failed dependencies reconcile to the highest-ranked one, so a
//! silencing behaviour such as `OMIT` wins over `ERROR` or `FAIL`.

use serde::Serialize;
use tracing::debug;

use crate::expression::{Contexts, ExpressionEngine, is_truthy};
use crate::models::{Dependency, DependencyBehaviour};

/// A dependency that was not satisfied, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyFailure {
    pub description: String,
    pub expression: String,
    pub on_fail: DependencyBehaviour,
    pub reason: String,
}

/// Reconciled behaviour plus the failures that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub behaviour: DependencyBehaviour,
    pub failures: Vec<DependencyFailure>,
}

impl Resolution {
    pub fn passed(&self) -> bool {
        self.behaviour == DependencyBehaviour::Pass
    }

    /// Human-readable summary of the failures.
    pub fn summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{} ({})", f.description, f.reason))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Clone, Copy)]
pub struct DependencyResolver<'a> {
    engine: &'a dyn ExpressionEngine,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(engine: &'a dyn ExpressionEngine) -> Self {
        Self { engine }
    }

    /// Reconciled behaviour for a set of dependencies; `Pass` when none fail.
    pub fn resolve(&self, dependencies: &[Dependency], contexts: &Contexts) -> DependencyBehaviour {
        self.resolve_detailed(dependencies, contexts).behaviour
    }

    pub fn resolve_detailed(&self, dependencies: &[Dependency], contexts: &Contexts) -> Resolution {
        let failures: Vec<DependencyFailure> = dependencies
            .iter()
            .filter_map(|dependency| {
                let reason = self.check(dependency, contexts).err()?;
                debug!(
                    dependency = dependency.label(),
                    on_fail = dependency.on_fail.name(),
                    reason = %reason,
                    "dependency not met"
                );
                Some(DependencyFailure {
                    description: dependency.label().to_string(),
                    expression: dependency.expression.clone(),
                    on_fail: dependency.on_fail,
                    reason,
                })
            })
            .collect();

        let behaviour = failures
            .iter()
            .map(|f| f.on_fail)
            .fold(DependencyBehaviour::Pass, DependencyBehaviour::max);

        Resolution {
            behaviour,
            failures,
        }
    }

    fn check(&self, dependency: &Dependency, contexts: &Contexts) -> Result<(), String> {
        let expression = self
            .engine
            .interpolate(&dependency.expression, contexts)
            .map_err(|e| e.to_string())?;
        let value = self
            .engine
            .evaluate(&expression, &dependency.syntax, contexts)
            .map_err(|e| e.to_string())?;

        if is_truthy(&value) {
            Ok(())
        } else {
            Err(format!("evaluated to {}", value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::MiniJinjaEngine;
    use serde_json::json;

    fn contexts() -> Contexts {
        let mut contexts = Contexts::new();
        contexts.insert("target".to_string(), json!({"os": "linux", "cores": 4}));
        contexts
    }

    fn failing(on_fail: DependencyBehaviour) -> Dependency {
        Dependency::new("target.os == 'windows'", on_fail)
    }

    #[test]
    fn test_no_failures_resolves_to_pass() {
        let engine = MiniJinjaEngine::new();
        let resolver = DependencyResolver::new(&engine);

        let deps = vec![
            Dependency::new("target.os == 'linux'", DependencyBehaviour::Omit),
            Dependency::new("target.cores >= 2", DependencyBehaviour::Error),
        ];
        assert_eq!(resolver.resolve(&deps, &contexts()), DependencyBehaviour::Pass);
        assert_eq!(resolver.resolve(&[], &contexts()), DependencyBehaviour::Pass);
    }

    #[test]
    fn test_fail_and_omit_resolve_to_omit() {
        let engine = MiniJinjaEngine::new();
        let resolver = DependencyResolver::new(&engine);

        let deps = vec![
            failing(DependencyBehaviour::Fail),
            failing(DependencyBehaviour::Omit),
        ];
        assert_eq!(resolver.resolve(&deps, &contexts()), DependencyBehaviour::Omit);
    }

    #[test]
    fn test_highest_rank_wins_for_every_pair() {
        let engine = MiniJinjaEngine::new();
        let resolver = DependencyResolver::new(&engine);
        let behaviours = [
            DependencyBehaviour::Fail,
            DependencyBehaviour::ReportOnly,
            DependencyBehaviour::Error,
            DependencyBehaviour::Omit,
        ];

        for a in behaviours {
            for b in behaviours {
                let deps = vec![failing(a), failing(b)];
                let expected = if a.rank() >= b.rank() { a } else { b };
                assert_eq!(resolver.resolve(&deps, &contexts()), expected);
            }
        }
    }

    #[test]
    fn test_only_failed_dependencies_contribute() {
        let engine = MiniJinjaEngine::new();
        let resolver = DependencyResolver::new(&engine);

        let deps = vec![
            Dependency::new("target.os == 'linux'", DependencyBehaviour::Omit),
            failing(DependencyBehaviour::ReportOnly),
        ];
        let resolution = resolver.resolve_detailed(&deps, &contexts());
        assert_eq!(resolution.behaviour, DependencyBehaviour::ReportOnly);
        assert_eq!(resolution.failures.len(), 1);
        assert!(!resolution.passed());
    }

    #[test]
    fn test_evaluation_error_counts_as_failure() {
        let engine = MiniJinjaEngine::new();
        let resolver = DependencyResolver::new(&engine);

        let deps = vec![Dependency::new("target.missing.deep == 1", DependencyBehaviour::Error)
            .with_description("needs a deep property")];
        let resolution = resolver.resolve_detailed(&deps, &contexts());

        assert_eq!(resolution.behaviour, DependencyBehaviour::Error);
        assert_eq!(resolution.failures[0].description, "needs a deep property");
        assert!(resolution.summary().starts_with("needs a deep property ("));
    }

    #[test]
    fn test_non_boolean_truthy_values_do_not_satisfy() {
        let engine = MiniJinjaEngine::new();
        let resolver = DependencyResolver::new(&engine);

        let deps = vec![Dependency::new("target.cores", DependencyBehaviour::Fail)];
        assert_eq!(resolver.resolve(&deps, &contexts()), DependencyBehaviour::Fail);

        let deps = vec![Dependency::new("target.cores - 3", DependencyBehaviour::Fail)];
        assert_eq!(resolver.resolve(&deps, &contexts()), DependencyBehaviour::Pass);
    }

    #[test]
    fn test_expression_is_interpolated_first() {
        let engine = MiniJinjaEngine::new();
        let resolver = DependencyResolver::new(&engine);

        let deps = vec![Dependency::new(
            "{{ target.cores }} == 4",
            DependencyBehaviour::Fail,
        )];
        assert_eq!(resolver.resolve(&deps, &contexts()), DependencyBehaviour::Pass);
    }
}

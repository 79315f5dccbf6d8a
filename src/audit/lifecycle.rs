//! Audit lifecycle - one policy against one target.
//!
//! ```text
//! START -> VALIDATE -> DEPENDENCIES -> BUILD_PARAMETERS -> RUN -> terminal outcome
//! ```
//!
//! Every stage returns `Result<_, Diagnostic>`; an `Err` jumps straight to its
//! terminal outcome. Nothing is retried and nothing escapes: panics in the
//! check body are caught here as well. Timing and the `audit.response` event
//! are recorded on every path.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{Value, json};
use tracing::debug;

use crate::events::{EVENT_AUDIT_RESPONSE, EventDispatcher};
use crate::expression::{Contexts, ExpressionEngine, state_context};
use crate::models::{AuditResponse, DEFAULT_SYNTAX, Diagnostic, Outcome, Policy, Severity};
use crate::target::Target;

use super::dependency::DependencyResolver;
use super::{AuditContext, AuditError, BatchCache, Checker};

/// Non-terminal lifecycle stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    Start,
    Validate,
    Dependencies,
    BuildParameters,
    Run,
}

impl LifecycleStage {
    pub fn name(self) -> &'static str {
        match self {
            LifecycleStage::Start => "start",
            LifecycleStage::Validate => "validate",
            LifecycleStage::Dependencies => "dependencies",
            LifecycleStage::BuildParameters => "build_parameters",
            LifecycleStage::Run => "run",
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the RUN stage produced when the check returned normally.
struct Completed {
    outcome: Outcome,
    tokens: BTreeMap<String, Value>,
    severity: Severity,
}

/// Best-effort text from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "check panicked".to_string()
    }
}

/// Map a check-body error to its terminal diagnostic.
pub fn diagnose(error: AuditError) -> Diagnostic {
    let kind = error.kind();
    match error {
        AuditError::TargetIncompatible(message) => {
            Diagnostic::new(Outcome::NotApplicable, kind, message)
        }
        AuditError::InvalidInput {
            message,
            upgrade_hint,
        } => {
            let diagnostic = Diagnostic::error(kind, message);
            match upgrade_hint {
                Some(hint) => diagnostic.with_token("upgrade_hint", hint),
                None => diagnostic,
            }
        }
        other => Diagnostic::error(kind, other.to_string()),
    }
}

pub struct AuditLifecycle<'a> {
    engine: &'a dyn ExpressionEngine,
    events: &'a dyn EventDispatcher,
}

impl<'a> AuditLifecycle<'a> {
    pub fn new(engine: &'a dyn ExpressionEngine, events: &'a dyn EventDispatcher) -> Self {
        Self { engine, events }
    }

    /// Audit `policy` with its own parameters.
    pub async fn execute(
        &self,
        policy: &Policy,
        target: &dyn Target,
        checker: &dyn Checker,
        cache: &mut BatchCache,
    ) -> AuditResponse {
        self.execute_with_parameters(policy, target, checker, cache, policy.parameters.clone())
            .await
    }

    /// Audit `policy` with parameters already merged with schema defaults.
    pub async fn execute_with_parameters(
        &self,
        policy: &Policy,
        target: &dyn Target,
        checker: &dyn Checker,
        cache: &mut BatchCache,
        parameters: Contexts,
    ) -> AuditResponse {
        let started_at = Utc::now();
        let clock = Instant::now();
        debug!(policy = %policy.name, stage = %LifecycleStage::Start, "auditing policy");

        let result = self.advance(policy, target, checker, cache, parameters).await;

        let response = match result {
            Ok(done) => AuditResponse::new(
                policy.clone(),
                done.outcome,
                done.severity,
                done.tokens,
                started_at,
                clock.elapsed(),
            ),
            Err(diagnostic) => AuditResponse::new(
                policy.clone(),
                diagnostic.outcome,
                policy.severity,
                diagnostic.into_tokens(),
                started_at,
                clock.elapsed(),
            ),
        };

        self.finalize(&response);
        response
    }

    /// Record a response for a policy that never entered the lifecycle.
    pub fn conclude(&self, policy: &Policy, diagnostic: Diagnostic) -> AuditResponse {
        let response = AuditResponse::from_diagnostic(policy, diagnostic);
        self.finalize(&response);
        response
    }

    async fn advance(
        &self,
        policy: &Policy,
        target: &dyn Target,
        checker: &dyn Checker,
        cache: &mut BatchCache,
        parameters: Contexts,
    ) -> Result<Completed, Diagnostic> {
        self.validate(policy, target, checker)?;
        self.check_dependencies(policy, target, &parameters)?;
        let parameters = self.build_parameters(policy, target, parameters)?;
        self.run(policy, target, checker, cache, parameters).await
    }

    fn validate(
        &self,
        policy: &Policy,
        target: &dyn Target,
        checker: &dyn Checker,
    ) -> Result<(), Diagnostic> {
        debug!(policy = %policy.name, stage = %LifecycleStage::Validate);
        let missing: Vec<&str> = checker
            .required_capabilities()
            .iter()
            .copied()
            .filter(|c| !target.has_capability(c))
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        Err(Diagnostic::new(
            Outcome::NotApplicable,
            "TargetIncompatible",
            format!(
                "{} requires capabilities not provided by target '{}': {}",
                checker.name(),
                target.name(),
                missing.join(", ")
            ),
        )
        .with_token("missing_capabilities", missing))
    }

    fn check_dependencies(
        &self,
        policy: &Policy,
        target: &dyn Target,
        parameters: &Contexts,
    ) -> Result<(), Diagnostic> {
        debug!(policy = %policy.name, stage = %LifecycleStage::Dependencies);
        if policy.depends.is_empty() {
            return Ok(());
        }

        let contexts = self.base_contexts(policy, target, parameters);
        let resolution =
            DependencyResolver::new(self.engine).resolve_detailed(&policy.depends, &contexts);

        match resolution.behaviour.outcome() {
            None => Ok(()),
            Some(outcome) => Err(Diagnostic::new(
                outcome,
                "DependencyFailure",
                format!("Policy dependency not met: {}", resolution.summary()),
            )
            .with_token("dependency_behaviour", resolution.behaviour.name())
            .with_token("dependencies", json!(resolution.failures))),
        }
    }

    fn build_parameters(
        &self,
        policy: &Policy,
        target: &dyn Target,
        mut parameters: Contexts,
    ) -> Result<Contexts, Diagnostic> {
        debug!(policy = %policy.name, stage = %LifecycleStage::BuildParameters);
        if policy.build_parameters.is_empty() {
            return Ok(parameters);
        }

        let mut contexts = self.base_contexts(policy, target, &parameters);
        for parameter in &policy.build_parameters {
            let value = self
                .engine
                .evaluate(&parameter.expression, DEFAULT_SYNTAX, &contexts)
                .map_err(|e| {
                    Diagnostic::error("ExpressionError", e.to_string())
                        .with_token("parameter", parameter.name.clone())
                })?;
            contexts.insert(parameter.name.clone(), value.clone());
            parameters.insert(parameter.name.clone(), value);
        }
        Ok(parameters)
    }

    async fn run(
        &self,
        policy: &Policy,
        target: &dyn Target,
        checker: &dyn Checker,
        cache: &mut BatchCache,
        parameters: Contexts,
    ) -> Result<Completed, Diagnostic> {
        debug!(policy = %policy.name, stage = %LifecycleStage::Run, checker = checker.name());
        let mut ctx = AuditContext::new(policy, target, self.engine, cache, parameters);

        let result = AssertUnwindSafe(checker.run(&mut ctx)).catch_unwind().await;
        let (tokens, severity) = ctx.into_parts();

        match result {
            Ok(Ok(outcome)) => Ok(Completed {
                outcome,
                tokens,
                severity,
            }),
            Ok(Err(error)) => {
                let mut diagnostic = diagnose(error);
                for (key, value) in tokens {
                    diagnostic.tokens.entry(key).or_insert(value);
                }
                Err(diagnostic)
            }
            Err(payload) => Err(Diagnostic::error("panic", panic_message(payload.as_ref()))),
        }
    }

    fn base_contexts(&self, policy: &Policy, target: &dyn Target, parameters: &Contexts) -> Contexts {
        let mut contexts = parameters.clone();
        contexts.insert("parameters".to_string(), Value::Object(parameters.clone()));
        contexts.insert("target".to_string(), target.properties());
        contexts.insert("state".to_string(), state_context());
        contexts.insert(
            "policy".to_string(),
            json!({
                "name": policy.name,
                "title": policy.title,
                "severity": policy.severity.name(),
            }),
        );
        contexts
    }

    fn finalize(&self, response: &AuditResponse) {
        debug!(
            policy = %response.name(),
            state = %response.state(),
            elapsed_ms = response.elapsed().as_millis() as u64,
            "policy audited"
        );
        self.events.dispatch(
            EVENT_AUDIT_RESPONSE,
            &json!({
                "policy": response.name(),
                "state": response.state().outcome().name(),
                "severity": response.severity().name(),
                "elapsed_ms": response.elapsed().as_millis() as u64,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::expression::MiniJinjaEngine;
    use crate::models::{Dependency, DependencyBehaviour};
    use crate::target::{LocalTarget, TargetError};

    #[derive(Default)]
    struct RecordingEvents {
        events: Mutex<Vec<(String, Value)>>,
    }

    impl EventDispatcher for RecordingEvents {
        fn dispatch(&self, event: &str, payload: &Value) {
            self.events
                .lock()
                .unwrap()
                .push((event.to_string(), payload.clone()));
        }
    }

    enum Behaviour {
        Return(Outcome),
        Fail(fn() -> AuditError),
        Panic,
        Escalate,
        EchoParameter(&'static str),
    }

    struct ScriptedCheck {
        behaviour: Behaviour,
        capabilities: &'static [&'static str],
        runs: AtomicUsize,
    }

    impl ScriptedCheck {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                capabilities: &[],
                runs: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Checker for ScriptedCheck {
        fn name(&self) -> &str {
            "scripted"
        }

        fn required_capabilities(&self) -> &[&'static str] {
            self.capabilities
        }

        async fn run(&self, ctx: &mut AuditContext<'_>) -> Result<Outcome, AuditError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.set("ran", true);
            match &self.behaviour {
                Behaviour::Return(outcome) => Ok(*outcome),
                Behaviour::Fail(make) => Err(make()),
                Behaviour::Panic => panic!("check exploded"),
                Behaviour::Escalate => {
                    ctx.escalate_severity(Severity::Critical);
                    Ok(Outcome::Failure)
                }
                Behaviour::EchoParameter(name) => {
                    let value = ctx.parameter(name).cloned().unwrap_or(Value::Null);
                    ctx.set("echo", value);
                    Ok(Outcome::Success)
                }
            }
        }
    }

    async fn audit(policy: &Policy, check: &ScriptedCheck) -> (AuditResponse, RecordingEvents) {
        let engine = MiniJinjaEngine::new();
        let events = RecordingEvents::default();
        let target = LocalTarget::new("t", json!({"os": "linux", "cores": 4}));
        let mut cache = BatchCache::new();
        let response = AuditLifecycle::new(&engine, &events)
            .execute(policy, &target, check, &mut cache)
            .await;
        (response, events)
    }

    #[tokio::test]
    async fn test_success_path_records_tokens_and_event() {
        let policy = Policy::new("p", "scripted");
        let check = ScriptedCheck::new(Behaviour::Return(Outcome::Success));

        let (response, events) = audit(&policy, &check).await;

        assert!(response.state().is_successful());
        assert_eq!(response.token("ran"), Some(&json!(true)));
        let events = events.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, EVENT_AUDIT_RESPONSE);
        assert_eq!(events[0].1["state"], json!("SUCCESS"));
    }

    #[tokio::test]
    async fn test_missing_capability_is_not_applicable() {
        let policy = Policy::new("p", "scripted");
        let mut check = ScriptedCheck::new(Behaviour::Return(Outcome::Success));
        check.capabilities = &["drush"];

        let (response, events) = audit(&policy, &check).await;

        assert!(response.state().is_not_applicable());
        assert_eq!(response.exception_type(), Some("TargetIncompatible"));
        assert_eq!(response.token("missing_capabilities"), Some(&json!(["drush"])));
        assert_eq!(check.runs.load(Ordering::SeqCst), 0);
        assert_eq!(events.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dependency_short_circuits_to_behaviour_outcome() {
        let cases = [
            (DependencyBehaviour::Fail, Outcome::Failure),
            (DependencyBehaviour::ReportOnly, Outcome::NotApplicable),
            (DependencyBehaviour::Error, Outcome::Error),
            (DependencyBehaviour::Omit, Outcome::Irrelevant),
        ];

        for (behaviour, expected) in cases {
            let policy = Policy::new("p", "scripted")
                .with_dependency(Dependency::new("target.os == 'windows'", behaviour));
            let check = ScriptedCheck::new(Behaviour::Return(Outcome::Success));

            let (response, _) = audit(&policy, &check).await;

            assert_eq!(response.state().outcome(), expected);
            assert_eq!(response.exception_type(), Some("DependencyFailure"));
            assert_eq!(check.runs.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_satisfied_dependency_runs_check() {
        let policy = Policy::new("p", "scripted")
            .with_dependency(Dependency::new("target.cores >= 2", DependencyBehaviour::Omit));
        let check = ScriptedCheck::new(Behaviour::Return(Outcome::Warning));

        let (response, _) = audit(&policy, &check).await;

        assert!(response.state().has_warning());
        assert_eq!(check.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_build_parameters_chain_in_order() {
        let policy = Policy::new("p", "scripted")
            .with_parameter("base", 10)
            .with_build_parameter("doubled", "base * 2")
            .with_build_parameter("total", "doubled + target.cores");
        let check = ScriptedCheck::new(Behaviour::EchoParameter("total"));

        let (response, _) = audit(&policy, &check).await;

        assert!(response.state().is_successful());
        assert_eq!(response.token("echo"), Some(&json!(24)));
    }

    #[tokio::test]
    async fn test_build_parameter_failure_is_error() {
        let policy = Policy::new("p", "scripted").with_build_parameter("broken", "nope.value + 1");
        let check = ScriptedCheck::new(Behaviour::Return(Outcome::Success));

        let (response, events) = audit(&policy, &check).await;

        assert!(response.state().has_error());
        assert_eq!(response.exception_type(), Some("ExpressionError"));
        assert_eq!(response.token("parameter"), Some(&json!("broken")));
        assert_eq!(check.runs.load(Ordering::SeqCst), 0);
        assert_eq!(events.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unclassified_error_is_error_with_tokens() {
        let policy = Policy::new("p", "scripted");
        let check = ScriptedCheck::new(Behaviour::Fail(|| {
            AuditError::Target(TargetError::ExecutionUnsupported {
                target: "t".to_string(),
            })
        }));

        let (response, _) = audit(&policy, &check).await;

        assert!(response.state().has_error());
        assert_eq!(response.exception_type(), Some("TargetError"));
        assert_eq!(response.exception(), Some("target 't' cannot execute commands"));
        assert_eq!(response.token("ran"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_incompatible_error_is_not_applicable() {
        let policy = Policy::new("p", "scripted");
        let check = ScriptedCheck::new(Behaviour::Fail(|| {
            AuditError::TargetIncompatible("no database".to_string())
        }));

        let (response, _) = audit(&policy, &check).await;

        assert!(response.state().is_not_applicable());
        assert_eq!(response.exception(), Some("no database"));
    }

    #[tokio::test]
    async fn test_invalid_input_attaches_upgrade_hint() {
        let policy = Policy::new("p", "scripted");
        let check = ScriptedCheck::new(Behaviour::Fail(|| AuditError::InvalidInput {
            message: "threshold must be numeric".to_string(),
            upgrade_hint: Some("update the policy to the latest version".to_string()),
        }));

        let (response, _) = audit(&policy, &check).await;

        assert!(response.state().has_error());
        assert_eq!(response.exception_type(), Some("InvalidInput"));
        assert_eq!(
            response.token("upgrade_hint"),
            Some(&json!("update the policy to the latest version"))
        );

        let check = ScriptedCheck::new(Behaviour::Fail(|| AuditError::invalid_input("bad")));
        let (response, _) = audit(&policy, &check).await;
        assert!(response.state().has_error());
        assert!(response.token("upgrade_hint").is_none());
    }

    #[tokio::test]
    async fn test_panic_is_contained_and_finalized() {
        let policy = Policy::new("p", "scripted");
        let check = ScriptedCheck::new(Behaviour::Panic);

        let (response, events) = audit(&policy, &check).await;

        assert!(response.state().has_error());
        assert_eq!(response.exception_type(), Some("panic"));
        assert_eq!(response.exception(), Some("check exploded"));
        assert_eq!(events.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_check_can_escalate_severity() {
        let policy = Policy::new("p", "scripted").with_severity(Severity::Low);
        let check = ScriptedCheck::new(Behaviour::Escalate);

        let (response, _) = audit(&policy, &check).await;

        assert!(response.state().is_failure());
        assert_eq!(response.severity(), Severity::Critical);
        assert_eq!(response.policy().severity, Severity::Low);
    }
}

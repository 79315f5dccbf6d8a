//! Report orchestration.
//!
//! ```text
//! profile -> dependency phase --(gate failed)--> DEPENDENCIES report
//!                  |
//!                  v
//!           assessment phase -> batches -> lifecycle per policy -> ASSESSMENT report
//! ```
//!
//! The dependency phase always completes before any assessment work starts.
//! Assessment runs in-process, or across worker processes when a
//! [`BatchLauncher`] is configured with [`ExecutionMode::Processes`].

pub mod batch;
pub mod distributed;
pub mod wire;

pub use batch::{Batch, BoundBatch};
pub use distributed::{BatchLauncher, ReportHandle, WorkerLauncher};
pub use wire::{WIRE_VERSION, WireError};

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::lifecycle::panic_message;
use crate::audit::{AuditLifecycle, CheckerRegistry, DependencyResolver, Prepared};
use crate::config::{ExecutionConfig, ExecutionMode};
use crate::events::{EVENT_REPORT_PHASE, EventDispatcher, TracingEvents};
use crate::expression::{Contexts, ExpressionEngine, MiniJinjaEngine, state_context};
use crate::models::{
    AuditResponse, Diagnostic, IntegrityError, Outcome, Policy, Profile, Report, ReportType,
};
use crate::process::{Process, ProcessManager};
use crate::target::Target;

use distributed::Invocation;

/// Outcome of starting a report.
#[derive(Debug)]
pub enum ReportRun {
    /// A profile dependency was not met; nothing was assessed
    Gated(Report),
    /// The assessment ran in-process
    Complete(Report),
    /// The assessment is running in worker processes
    Running(ReportHandle),
}

impl ReportRun {
    /// The final report, waiting for workers if needed.
    pub async fn finish(self) -> Result<Report, IntegrityError> {
        match self {
            ReportRun::Gated(report) | ReportRun::Complete(report) => Ok(report),
            ReportRun::Running(handle) => handle.finish().await,
        }
    }
}

/// Builds reports for profiles against targets.
#[derive(Clone)]
pub struct ReportBuilder {
    registry: Arc<CheckerRegistry>,
    engine: Arc<dyn ExpressionEngine>,
    events: Arc<dyn EventDispatcher>,
    config: ExecutionConfig,
    launcher: Option<Arc<dyn BatchLauncher>>,
}

impl ReportBuilder {
    pub fn new(registry: CheckerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            engine: Arc::new(MiniJinjaEngine::new()),
            events: Arc::new(TracingEvents),
            config: ExecutionConfig::default(),
            launcher: None,
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn ExpressionEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    /// Launcher used for worker processes in [`ExecutionMode::Processes`].
    pub fn with_launcher(mut self, launcher: Arc<dyn BatchLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn registry(&self) -> &CheckerRegistry {
        &self.registry
    }

    fn lifecycle(&self) -> AuditLifecycle<'_> {
        AuditLifecycle::new(self.engine.as_ref(), self.events.as_ref())
    }

    /// Run both phases and return the final report.
    ///
    /// Only a broken result count surfaces as an error; every policy failure
    /// is recorded in the report instead.
    pub async fn build(&self, profile: &Profile, target: &dyn Target) -> Result<Report, IntegrityError> {
        self.start(profile, target).await?.finish().await
    }

    /// Run the dependency phase, then either assess in-process or hand back a
    /// handle over the running workers.
    pub async fn start(
        &self,
        profile: &Profile,
        target: &dyn Target,
    ) -> Result<ReportRun, IntegrityError> {
        info!(profile = %profile.name, target = %target.name(), "Phase 1: dependencies");
        let gate = self.run_dependencies(profile, target)?;
        if !gate.is_successful() {
            warn!(
                profile = %profile.name,
                "profile dependencies not met; skipping assessment"
            );
            return Ok(ReportRun::Gated(gate));
        }

        match (&self.config.mode, &self.launcher) {
            (ExecutionMode::Processes, Some(launcher)) => {
                info!(profile = %profile.name, "Phase 2: assessment (worker processes)");
                let handle = self.dispatch(profile, launcher.as_ref());
                Ok(ReportRun::Running(handle))
            }
            (ExecutionMode::Processes, None) => {
                warn!("no worker launcher configured; assessing in-process");
                Ok(ReportRun::Complete(self.run_assessment(profile, target).await?))
            }
            (ExecutionMode::InProcess, _) => {
                info!(profile = %profile.name, "Phase 2: assessment");
                Ok(ReportRun::Complete(self.run_assessment(profile, target).await?))
            }
        }
    }

    // ========================================================================
    // Dependency Phase
    // ========================================================================

    /// Gate the profile on its dependency policies.
    ///
    /// Each dependency policy is resolved against the target and state
    /// contexts only, without running its check. It passes when its
    /// dependencies resolve to `PASS`; any other behaviour is a failure.
    pub fn run_dependencies(
        &self,
        profile: &Profile,
        target: &dyn Target,
    ) -> Result<Report, IntegrityError> {
        self.phase_event(profile, ReportType::Dependencies, "started", None);

        let mut contexts = Contexts::new();
        contexts.insert("target".to_string(), target.properties());
        contexts.insert("state".to_string(), state_context());

        let resolver = DependencyResolver::new(self.engine.as_ref());
        let results: Vec<AuditResponse> = profile
            .dependencies
            .iter()
            .map(|policy| self.gate(policy, &resolver, &contexts))
            .collect();

        let report = Report::new(
            &profile.name,
            ReportType::Dependencies,
            &profile.dependencies,
            results,
        )?;
        self.phase_event(
            profile,
            ReportType::Dependencies,
            "finished",
            Some(report.is_successful()),
        );
        Ok(report)
    }

    fn gate(
        &self,
        policy: &Policy,
        resolver: &DependencyResolver<'_>,
        contexts: &Contexts,
    ) -> AuditResponse {
        let started_at = Utc::now();
        let clock = Instant::now();
        let resolution = resolver.resolve_detailed(&policy.depends, contexts);

        let mut tokens = BTreeMap::new();
        let outcome = if resolution.passed() {
            Outcome::Success
        } else {
            tokens.insert(
                "dependency_behaviour".to_string(),
                json!(resolution.behaviour.name()),
            );
            tokens.insert("dependencies".to_string(), json!(&resolution.failures));
            tokens.insert("reason".to_string(), json!(resolution.summary()));
            Outcome::Failure
        };
        debug!(policy = %policy.name, %outcome, "dependency gate evaluated");

        AuditResponse::new(
            policy.clone(),
            outcome,
            policy.severity,
            tokens,
            started_at,
            clock.elapsed(),
        )
    }

    // ========================================================================
    // Assessment Phase (in-process)
    // ========================================================================

    /// Assess every profile policy in-process.
    pub async fn run_assessment(
        &self,
        profile: &Profile,
        target: &dyn Target,
    ) -> Result<Report, IntegrityError> {
        self.phase_event(profile, ReportType::Assessment, "started", None);
        let results = self.assess_policies(&profile.policies, target).await;
        let report = Report::new(
            &profile.name,
            ReportType::Assessment,
            &profile.policies,
            results,
        )?;
        info!(
            profile = %profile.name,
            successful = report.is_successful(),
            severity = %report.severity(),
            "assessment phase finished"
        );
        self.phase_event(
            profile,
            ReportType::Assessment,
            "finished",
            Some(report.is_successful()),
        );
        Ok(report)
    }

    /// Audit policies batch by batch, one response per policy.
    pub async fn assess_policies(
        &self,
        policies: &[Policy],
        target: &dyn Target,
    ) -> Vec<AuditResponse> {
        let lifecycle = self.lifecycle();
        let mut results = Vec::with_capacity(policies.len());

        for batch in Batch::partition(policies) {
            let mut bound = match batch.bind(&self.registry) {
                Ok(bound) => bound,
                Err(diagnostic) => {
                    warn!(
                        implementation = %batch.implementation(),
                        error = %diagnostic.message,
                        "batch cannot run"
                    );
                    results.extend(
                        batch
                            .policies()
                            .iter()
                            .map(|policy| lifecycle.conclude(policy, diagnostic.clone())),
                    );
                    continue;
                }
            };

            for policy in batch.policies() {
                let audited = AssertUnwindSafe(bound.audit(policy, target, &lifecycle))
                    .catch_unwind()
                    .await;
                let response = match audited {
                    Ok(response) => response,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        warn!(policy = %policy.name, %message, "policy audit panicked");
                        lifecycle.conclude(policy, Diagnostic::error("panic", message))
                    }
                };
                results.push(response);
            }
        }

        results
    }

    // ========================================================================
    // Assessment Phase (worker processes)
    // ========================================================================

    fn dispatch(&self, profile: &Profile, launcher: &dyn BatchLauncher) -> ReportHandle {
        self.phase_event(profile, ReportType::Assessment, "started", None);
        let lifecycle = self.lifecycle();
        let mut settled = Vec::new();
        let mut invocations: Vec<Invocation> = Vec::new();

        for batch in Batch::partition(&profile.policies) {
            let bound = match batch.bind(&self.registry) {
                Ok(bound) => bound,
                Err(diagnostic) => {
                    settled.extend(
                        batch
                            .policies()
                            .iter()
                            .map(|policy| lifecycle.conclude(policy, diagnostic.clone())),
                    );
                    continue;
                }
            };

            let first = invocations.len();
            for policy in batch.policies() {
                match bound.prepare(policy) {
                    Prepared::Skip(diagnostic) => {
                        settled.push(lifecycle.conclude(policy, diagnostic));
                    }
                    Prepared::Individual => invocations.push(Invocation {
                        label: format!("{}:{}", batch.implementation(), policy.name),
                        policies: vec![policy.clone()],
                    }),
                    Prepared::Group(key) => {
                        let label = format!("{}[{}]", batch.implementation(), key);
                        match invocations[first..].iter_mut().find(|i| i.label == label) {
                            Some(invocation) => invocation.policies.push(policy.clone()),
                            None => invocations.push(Invocation {
                                label,
                                policies: vec![policy.clone()],
                            }),
                        }
                    }
                }
            }
        }

        let mut manager: ProcessManager<Box<dyn Process>> = ProcessManager::new()
            .with_max_concurrency(self.config.max_concurrency)
            .with_poll_interval(self.config.poll_interval());
        for invocation in &invocations {
            let process = launcher.launch(&invocation.policies);
            // Positional names are unique by construction.
            if let Err(e) = manager.add(process, None) {
                warn!(invocation = %invocation.label, error = %e, "invocation not registered");
            }
        }
        info!(
            invocations = invocations.len(),
            settled = settled.len(),
            max_concurrency = manager.max_concurrency(),
            "worker invocations prepared"
        );

        ReportHandle::new(
            profile.name.clone(),
            profile.policies.clone(),
            settled,
            invocations,
            manager,
            Arc::clone(&self.events),
        )
    }

    fn phase_event(
        &self,
        profile: &Profile,
        phase: ReportType,
        status: &str,
        successful: Option<bool>,
    ) {
        self.events.dispatch(
            EVENT_REPORT_PHASE,
            &json!({
                "profile": profile.name,
                "phase": phase.to_string(),
                "status": status,
                "successful": successful,
            }),
        );
    }
}

impl std::fmt::Debug for ReportBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportBuilder")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("distributed", &self.launcher.is_some())
            .finish()
    }
}

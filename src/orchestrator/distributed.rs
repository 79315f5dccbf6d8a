//! Assessment across worker processes.
//!
//! Each batch is split into invocations by its check's `prepare` hook: one per
//! individually scheduled policy and one per group key. Invocations run under
//! a [`ProcessManager`]; once all have exited their payloads are decoded and
//! merged by policy name. An invocation that fails or returns garbage yields
//! no results, and its policies are recorded as `ERROR` so the report still
//! holds exactly one response per policy.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::events::{EVENT_REPORT_PHASE, EventDispatcher};
use crate::models::{AuditResponse, Diagnostic, IntegrityError, Policy, Report, ReportType};
use crate::process::{CommandProcess, ManagedProcess, Process, ProcessManager, ProcessOutput};

use super::wire;

/// Starts the process that assesses a set of policies.
pub trait BatchLauncher: Send + Sync {
    fn launch(&self, policies: &[Policy]) -> Box<dyn Process>;
}

/// Launches `program args... --policy <name>...`, expecting a wire payload
/// on stdout.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl WorkerLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(900),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl BatchLauncher for WorkerLauncher {
    fn launch(&self, policies: &[Policy]) -> Box<dyn Process> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for policy in policies {
            command.arg("--policy").arg(&policy.name);
        }
        Box::new(CommandProcess::new(command, self.timeout))
    }
}

/// Policies assessed by one worker process.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub label: String,
    pub policies: Vec<Policy>,
}

// ============================================================================
// Report Handle
// ============================================================================

/// An assessment phase running in worker processes.
///
/// Drive it with [`update`](Self::update) to observe progress, or call
/// [`finish`](Self::finish) to wait for the report.
pub struct ReportHandle {
    profile: String,
    policies: Vec<Policy>,
    settled: Vec<AuditResponse>,
    invocations: Vec<Invocation>,
    manager: ProcessManager<Box<dyn Process>>,
    events: Arc<dyn EventDispatcher>,
}

impl ReportHandle {
    pub(crate) fn new(
        profile: String,
        policies: Vec<Policy>,
        settled: Vec<AuditResponse>,
        invocations: Vec<Invocation>,
        manager: ProcessManager<Box<dyn Process>>,
        events: Arc<dyn EventDispatcher>,
    ) -> Self {
        Self {
            profile,
            policies,
            settled,
            invocations,
            manager,
            events,
        }
    }

    /// Start waiting invocations, up to the concurrency ceiling.
    pub fn update(&mut self) {
        self.manager.update();
    }

    pub fn has_finished(&self) -> bool {
        self.manager.has_finished()
    }

    /// Number of worker invocations.
    pub fn len(&self) -> usize {
        self.manager.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manager.is_empty()
    }

    /// Invocations currently running.
    pub fn active(&self) -> usize {
        self.manager.active()
    }

    /// Invocations that have exited.
    pub fn completed(&self) -> usize {
        self.manager.completed()
    }

    /// Wait for every invocation and build the assessment report.
    pub async fn finish(self) -> Result<Report, IntegrityError> {
        let ReportHandle {
            profile,
            policies,
            settled,
            invocations,
            manager,
            events,
        } = self;

        let report = manager
            .then(move |group| collect(group, &invocations))
            .then(move |collected| merge(&profile, &policies, settled, collected))
            .resolve()
            .await?;

        info!(
            profile = %report.profile(),
            successful = report.is_successful(),
            severity = %report.severity(),
            "assessment phase finished"
        );
        events.dispatch(
            EVENT_REPORT_PHASE,
            &json!({
                "profile": report.profile(),
                "phase": ReportType::Assessment.to_string(),
                "status": "finished",
                "successful": report.is_successful(),
            }),
        );
        Ok(report)
    }
}

impl std::fmt::Debug for ReportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportHandle")
            .field("profile", &self.profile)
            .field("invocations", &self.invocations.len())
            .field("completed", &self.completed())
            .finish()
    }
}

/// Decoded responses plus the failure reason of each policy whose worker
/// produced nothing usable.
struct Collected {
    responses: Vec<AuditResponse>,
    failures: BTreeMap<String, String>,
}

fn collect(group: Vec<ManagedProcess<Box<dyn Process>>>, invocations: &[Invocation]) -> Collected {
    let mut collected = Collected {
        responses: Vec::new(),
        failures: BTreeMap::new(),
    };

    for (managed, invocation) in group.iter().zip(invocations) {
        match decode_output(managed.output()) {
            Ok(responses) => {
                let expected: HashSet<&str> =
                    invocation.policies.iter().map(|p| p.name.as_str()).collect();
                for response in responses {
                    if expected.contains(response.name()) {
                        collected.responses.push(response);
                    } else {
                        warn!(
                            invocation = %invocation.label,
                            policy = %response.name(),
                            "discarding result for a policy this worker was not given"
                        );
                    }
                }
            }
            Err(reason) => {
                error!(
                    invocation = %invocation.label,
                    pid = ?managed.process.pid(),
                    reason = %reason,
                    "worker process failed; its results are lost"
                );
                for policy in &invocation.policies {
                    collected
                        .failures
                        .insert(policy.name.clone(), reason.clone());
                }
            }
        }
    }

    collected
}

fn decode_output(output: Option<ProcessOutput>) -> Result<Vec<AuditResponse>, String> {
    let output = output.ok_or_else(|| "worker produced no output".to_string())?;
    if let Some(failure) = &output.failure {
        return Err(failure.clone());
    }
    if !output.success() {
        return Err(format!(
            "worker exited with status {:?}: {}",
            output.exit_code,
            output.stderr.trim()
        ));
    }
    wire::decode(&output.stdout).map_err(|e| format!("undecodable worker payload: {}", e))
}

fn merge(
    profile: &str,
    policies: &[Policy],
    settled: Vec<AuditResponse>,
    collected: Collected,
) -> Result<Report, IntegrityError> {
    let mut results: Vec<AuditResponse> = Vec::with_capacity(policies.len());
    let mut seen: HashSet<String> = HashSet::new();

    for response in settled.into_iter().chain(collected.responses) {
        if seen.insert(response.name().to_string()) {
            results.push(response);
        } else {
            warn!(policy = %response.name(), "duplicate result discarded");
        }
    }

    for policy in policies {
        if seen.contains(&policy.name) {
            continue;
        }
        let reason = collected
            .failures
            .get(&policy.name)
            .cloned()
            .unwrap_or_else(|| "worker returned no result for this policy".to_string());
        results.push(AuditResponse::from_diagnostic(
            policy,
            Diagnostic::error("ProcessFailure", reason),
        ));
    }

    Report::new(profile, ReportType::Assessment, policies, results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_output_failures() {
        assert!(decode_output(None).is_err());

        let timed_out = ProcessOutput::failed("timed out after 1s");
        assert_eq!(decode_output(Some(timed_out)).unwrap_err(), "timed out after 1s");

        let crashed = ProcessOutput {
            exit_code: Some(2),
            stderr: "boom\n".to_string(),
            ..ProcessOutput::default()
        };
        assert!(decode_output(Some(crashed)).unwrap_err().contains("boom"));

        let garbage = ProcessOutput {
            exit_code: Some(0),
            stdout: "{not json".to_string(),
            ..ProcessOutput::default()
        };
        assert!(
            decode_output(Some(garbage))
                .unwrap_err()
                .starts_with("undecodable worker payload")
        );
    }

    #[test]
    fn test_merge_backfills_missing_policies() {
        let policies = vec![Policy::new("a", "analysis"), Policy::new("b", "analysis")];
        let mut failures = BTreeMap::new();
        failures.insert("b".to_string(), "worker exited with status Some(1)".to_string());
        let collected = Collected {
            responses: vec![AuditResponse::from_diagnostic(
                &policies[0],
                Diagnostic::new(crate::models::Outcome::Success, "", ""),
            )],
            failures,
        };

        let report = merge("p", &policies, Vec::new(), collected).unwrap();

        assert_eq!(report.len(), 2);
        let b = report.get("b").unwrap();
        assert!(b.state().has_error());
        assert_eq!(b.exception_type(), Some("ProcessFailure"));
        assert_eq!(b.exception(), Some("worker exited with status Some(1)"));
        assert!(!report.is_successful());
    }

    #[test]
    fn test_worker_launcher_builds_process() {
        let launcher = WorkerLauncher::new("/bin/true", vec!["worker".to_string()])
            .with_timeout(Duration::from_secs(5));
        let process = launcher.launch(&[Policy::new("a", "analysis")]);
        assert!(!process.is_started());
    }
}

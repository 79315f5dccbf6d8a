use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::outcome::Severity;
use super::policy::Policy;
use super::response::AuditResponse;

/// Which phase of a run a report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportType {
    /// Profile-level dependency gate
    Dependencies,
    /// Policy assessment
    Assessment,
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportType::Dependencies => f.write_str("DEPENDENCIES"),
            ReportType::Assessment => f.write_str("ASSESSMENT"),
        }
    }
}

/// The results do not correspond one-to-one with the submitted policies.
///
/// This indicates an orchestration bug rather than a check failure and is the
/// only error a report build surfaces to its caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("{report_type} report expected {expected} results but received {actual}")]
    CountMismatch {
        report_type: ReportType,
        expected: usize,
        actual: usize,
    },
    #[error("{report_type} report has no result for policy '{policy}'")]
    MissingResult {
        report_type: ReportType,
        policy: String,
    },
    #[error("{report_type} report received a result for unsubmitted policy '{policy}'")]
    UnexpectedResult {
        report_type: ReportType,
        policy: String,
    },
}

// ============================================================================
// Report
// ============================================================================

/// Immutable aggregate of audit responses for one phase of a profile run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    profile: String,
    report_type: ReportType,
    severity: Severity,
    successful: bool,
    created_at: DateTime<Utc>,
    results: Vec<AuditResponse>,
}

impl Report {
    /// Build a report, checking that every submitted policy has exactly one
    /// result. Results are ordered as the policies were submitted.
    pub fn new(
        profile: impl Into<String>,
        report_type: ReportType,
        policies: &[Policy],
        results: Vec<AuditResponse>,
    ) -> Result<Self, IntegrityError> {
        if policies.len() != results.len() {
            return Err(IntegrityError::CountMismatch {
                report_type,
                expected: policies.len(),
                actual: results.len(),
            });
        }

        let submitted: HashSet<&str> = policies.iter().map(|p| p.name.as_str()).collect();
        if let Some(stray) = results.iter().find(|r| !submitted.contains(r.name())) {
            return Err(IntegrityError::UnexpectedResult {
                report_type,
                policy: stray.name().to_string(),
            });
        }

        let mut remaining = results;
        let mut ordered = Vec::with_capacity(policies.len());
        for policy in policies {
            let position = remaining
                .iter()
                .position(|r| r.name() == policy.name)
                .ok_or_else(|| IntegrityError::MissingResult {
                    report_type,
                    policy: policy.name.clone(),
                })?;
            ordered.push(remaining.swap_remove(position));
        }

        Ok(Self::aggregate(profile.into(), report_type, ordered))
    }

    fn aggregate(profile: String, report_type: ReportType, results: Vec<AuditResponse>) -> Self {
        let aggregated = || results.iter().filter(|r| r.state().is_aggregated());

        let successful = aggregated().all(|r| r.state().is_successful());
        let severity = aggregated()
            .filter(|r| !r.state().is_successful())
            .map(|r| r.severity())
            .max()
            .unwrap_or(Severity::Normal);

        Self {
            profile,
            report_type,
            severity,
            successful,
            created_at: Utc::now(),
            results,
        }
    }

    /// A new report with `response` replacing the result of the same policy.
    pub fn with_response(&self, response: AuditResponse) -> Result<Self, IntegrityError> {
        let policies: Vec<Policy> = self.results.iter().map(|r| r.policy().clone()).collect();
        let mut results: Vec<AuditResponse> = self
            .results
            .iter()
            .filter(|r| r.name() != response.name())
            .cloned()
            .collect();
        results.push(response);
        Self::new(self.profile.clone(), self.report_type, &policies, results)
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn report_type(&self) -> ReportType {
        self.report_type
    }

    /// Highest severity among unsuccessful results, `Normal` when there are none.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_successful(&self) -> bool {
        self.successful
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn results(&self) -> &[AuditResponse] {
        &self.results
    }

    pub fn get(&self, policy: &str) -> Option<&AuditResponse> {
        self.results.iter().find(|r| r.name() == policy)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::models::Outcome;

    fn response(name: &str, outcome: Outcome, severity: Severity) -> AuditResponse {
        AuditResponse::new(
            Policy::new(name, "analysis").with_severity(severity),
            outcome,
            severity,
            BTreeMap::new(),
            Utc::now(),
            Duration::ZERO,
        )
    }

    fn policies(names: &[&str]) -> Vec<Policy> {
        names.iter().map(|n| Policy::new(*n, "analysis")).collect()
    }

    #[test]
    fn test_count_mismatch_is_integrity_error() {
        let result = Report::new(
            "p",
            ReportType::Assessment,
            &policies(&["a", "b", "c"]),
            vec![
                response("a", Outcome::Success, Severity::Normal),
                response("b", Outcome::Success, Severity::Normal),
            ],
        );
        assert_eq!(
            result.unwrap_err(),
            IntegrityError::CountMismatch {
                report_type: ReportType::Assessment,
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn test_duplicate_result_is_integrity_error() {
        let result = Report::new(
            "p",
            ReportType::Assessment,
            &policies(&["a", "b"]),
            vec![
                response("a", Outcome::Success, Severity::Normal),
                response("a", Outcome::Failure, Severity::Normal),
            ],
        );
        assert!(matches!(
            result,
            Err(IntegrityError::MissingResult { ref policy, .. }) if policy == "b"
        ));
    }

    #[test]
    fn test_unexpected_result_is_integrity_error() {
        let result = Report::new(
            "p",
            ReportType::Assessment,
            &policies(&["a"]),
            vec![response("z", Outcome::Success, Severity::Normal)],
        );
        assert!(matches!(result, Err(IntegrityError::UnexpectedResult { .. })));
    }

    #[test]
    fn test_successful_and_severity_aggregation() {
        let report = Report::new(
            "p",
            ReportType::Assessment,
            &policies(&["a", "b", "c", "d"]),
            vec![
                response("a", Outcome::Success, Severity::Critical),
                response("b", Outcome::Failure, Severity::Low),
                response("c", Outcome::Error, Severity::High),
                response("d", Outcome::Warning, Severity::Critical),
            ],
        )
        .unwrap();

        assert!(!report.is_successful());
        assert_eq!(report.severity(), Severity::High);
    }

    #[test]
    fn test_not_applicable_and_irrelevant_are_excluded() {
        let report = Report::new(
            "p",
            ReportType::Assessment,
            &policies(&["a", "b", "c"]),
            vec![
                response("a", Outcome::Success, Severity::Normal),
                response("b", Outcome::NotApplicable, Severity::Critical),
                response("c", Outcome::Irrelevant, Severity::Critical),
            ],
        )
        .unwrap();

        assert!(report.is_successful());
        assert_eq!(report.severity(), Severity::Normal);
        assert_eq!(report.len(), 3);
    }

    #[test]
    fn test_empty_report_defaults() {
        let report = Report::new("p", ReportType::Dependencies, &[], vec![]).unwrap();
        assert!(report.is_successful());
        assert!(report.is_empty());
        assert_eq!(report.severity(), Severity::Normal);
    }

    #[test]
    fn test_results_follow_submission_order() {
        let report = Report::new(
            "p",
            ReportType::Assessment,
            &policies(&["a", "b", "c"]),
            vec![
                response("c", Outcome::Success, Severity::Normal),
                response("a", Outcome::Success, Severity::Normal),
                response("b", Outcome::Success, Severity::Normal),
            ],
        )
        .unwrap();

        let names: Vec<&str> = report.results().iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_with_response_builds_new_report() {
        let report = Report::new(
            "p",
            ReportType::Assessment,
            &policies(&["a", "b"]),
            vec![
                response("a", Outcome::Success, Severity::Normal),
                response("b", Outcome::Success, Severity::Normal),
            ],
        )
        .unwrap();

        let updated = report
            .with_response(response("b", Outcome::Failure, Severity::Critical))
            .unwrap();

        assert!(report.is_successful());
        assert!(!updated.is_successful());
        assert_eq!(updated.severity(), Severity::Critical);
        assert_eq!(updated.results()[1].name(), "b");
    }
}

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::outcome::{Outcome, Severity, State, classify};
use super::policy::Policy;

/// Token key holding the failure message.
pub const TOKEN_EXCEPTION: &str = "exception";
/// Token key holding the failure kind.
pub const TOKEN_EXCEPTION_TYPE: &str = "exception_type";

// ============================================================================
// Diagnostic
// ============================================================================

/// A classified early exit from auditing a policy.
///
/// Carries the terminal outcome together with the explanation that ends up in
/// the response tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub outcome: Outcome,
    pub exception_type: String,
    pub message: String,
    pub tokens: BTreeMap<String, Value>,
}

impl Diagnostic {
    pub fn new(
        outcome: Outcome,
        exception_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            outcome,
            exception_type: exception_type.into(),
            message: message.into(),
            tokens: BTreeMap::new(),
        }
    }

    /// An `ERROR` diagnostic.
    pub fn error(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Outcome::Error, exception_type, message)
    }

    pub fn with_token(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tokens.insert(key.into(), value.into());
        self
    }

    /// Tokens including the `exception` and `exception_type` entries.
    pub fn into_tokens(self) -> BTreeMap<String, Value> {
        let mut tokens = self.tokens;
        tokens.insert(TOKEN_EXCEPTION.to_string(), Value::String(self.message));
        tokens.insert(
            TOKEN_EXCEPTION_TYPE.to_string(),
            Value::String(self.exception_type),
        );
        tokens
    }
}

// ============================================================================
// Audit Response
// ============================================================================

/// Result of auditing one policy against one target.
///
/// Immutable once built; the `with_*` methods return a modified copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditResponse {
    policy: Policy,
    state: State,
    /// Policy severity, possibly escalated by the check
    severity: Severity,
    #[serde(default)]
    tokens: BTreeMap<String, Value>,
    started_at: DateTime<Utc>,
    elapsed_ms: u64,
}

impl AuditResponse {
    pub fn new(
        policy: Policy,
        outcome: Outcome,
        severity: Severity,
        tokens: BTreeMap<String, Value>,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> Self {
        Self {
            policy,
            state: classify(outcome),
            severity,
            tokens,
            started_at,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Response for a policy that never reached its check.
    pub fn from_diagnostic(policy: &Policy, diagnostic: Diagnostic) -> Self {
        let outcome = diagnostic.outcome;
        Self::new(
            policy.clone(),
            outcome,
            policy.severity,
            diagnostic.into_tokens(),
            Utc::now(),
            Duration::ZERO,
        )
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn name(&self) -> &str {
        &self.policy.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn tokens(&self) -> &BTreeMap<String, Value> {
        &self.tokens
    }

    pub fn token(&self, key: &str) -> Option<&Value> {
        self.tokens.get(key)
    }

    /// Shorthand for the `exception` token as a string.
    pub fn exception(&self) -> Option<&str> {
        self.token(TOKEN_EXCEPTION).and_then(Value::as_str)
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.token(TOKEN_EXCEPTION_TYPE).and_then(Value::as_str)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    pub fn with_outcome(&self, outcome: Outcome) -> Self {
        Self {
            state: classify(outcome),
            ..self.clone()
        }
    }

    pub fn with_token(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut response = self.clone();
        response.tokens.insert(key.into(), value.into());
        response
    }
}

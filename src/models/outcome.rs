use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Outcome
// ============================================================================

/// Raw signal returned by a check implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Check passed
    Success,
    /// Check failed
    Failure,
    /// Informational result, counts as a pass
    Notice,
    /// Passed, but flagged for attention
    Warning,
    /// Failed, and flagged for attention
    WarningFail,
    /// The check could not be completed
    Error,
    /// The check does not apply to this target
    NotApplicable,
    /// Recorded but excluded from every aggregate
    Irrelevant,
}

impl Outcome {
    /// Every outcome, in code order.
    pub const ALL: [Outcome; 8] = [
        Outcome::NotApplicable,
        Outcome::Irrelevant,
        Outcome::Success,
        Outcome::Failure,
        Outcome::Notice,
        Outcome::Warning,
        Outcome::WarningFail,
        Outcome::Error,
    ];

    /// Stable upper-case name, as exposed to expressions.
    pub fn name(self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failure => "FAILURE",
            Outcome::Notice => "NOTICE",
            Outcome::Warning => "WARNING",
            Outcome::WarningFail => "WARNING_FAIL",
            Outcome::Error => "ERROR",
            Outcome::NotApplicable => "NOT_APPLICABLE",
            Outcome::Irrelevant => "IRRELEVANT",
        }
    }

    /// Integer code exposed to expressions through the `state` context.
    pub fn code(self) -> i64 {
        match self {
            Outcome::NotApplicable => -2,
            Outcome::Irrelevant => -1,
            Outcome::Success => 0,
            Outcome::Failure => 1,
            Outcome::Notice => 2,
            Outcome::Warning => 4,
            Outcome::WarningFail => 8,
            Outcome::Error => 16,
        }
    }

    /// Interpret a loosely typed check result: `true`/`1` pass, `false`/`0` fail,
    /// outcome names map to themselves. Anything else is an error signal.
    pub fn from_value(value: &Value) -> Outcome {
        match value {
            Value::Bool(true) => Outcome::Success,
            Value::Bool(false) => Outcome::Failure,
            Value::Number(n) if n.as_f64() == Some(1.0) => Outcome::Success,
            Value::Number(n) if n.as_f64() == Some(0.0) => Outcome::Failure,
            Value::String(s) => s.parse().unwrap_or(Outcome::Error),
            _ => Outcome::Error,
        }
    }
}

impl From<bool> for Outcome {
    fn from(passed: bool) -> Self {
        if passed {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Outcome::ALL
            .into_iter()
            .find(|o| o.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown outcome '{}'", s))
    }
}

// ============================================================================
// State
// ============================================================================

/// Normalized, queryable classification of an [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Outcome", into = "Outcome")]
pub struct State {
    outcome: Outcome,
}

/// Classify a raw outcome. Total and deterministic.
pub fn classify(outcome: Outcome) -> State {
    State { outcome }
}

impl State {
    /// The outcome this state was classified from.
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn is_successful(&self) -> bool {
        matches!(
            self.outcome,
            Outcome::Success | Outcome::Notice | Outcome::Warning
        )
    }

    /// Unsuccessful and not excluded from aggregation.
    pub fn is_failure(&self) -> bool {
        matches!(
            self.outcome,
            Outcome::Failure | Outcome::WarningFail | Outcome::Error
        )
    }

    pub fn has_error(&self) -> bool {
        self.outcome == Outcome::Error
    }

    pub fn has_warning(&self) -> bool {
        matches!(self.outcome, Outcome::Warning | Outcome::WarningFail)
    }

    pub fn is_notice(&self) -> bool {
        self.outcome == Outcome::Notice
    }

    pub fn is_not_applicable(&self) -> bool {
        self.outcome == Outcome::NotApplicable
    }

    pub fn is_irrelevant(&self) -> bool {
        self.outcome == Outcome::Irrelevant
    }

    /// Whether this state takes part in report success and severity.
    pub fn is_aggregated(&self) -> bool {
        !self.is_not_applicable() && !self.is_irrelevant()
    }
}

impl From<Outcome> for State {
    fn from(outcome: Outcome) -> Self {
        classify(outcome)
    }
}

impl From<State> for Outcome {
    fn from(state: State) -> Self {
        state.outcome
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.outcome.fmt(f)
    }
}

// ============================================================================
// Severity
// ============================================================================

/// Ranked importance of a policy. Ordering follows the weight.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Severity {
    pub fn weight(self) -> u8 {
        match self {
            Severity::None => 0,
            Severity::Low => 1,
            Severity::Normal => 2,
            Severity::High => 4,
            Severity::Critical => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Normal => "normal",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Severity::None),
            "low" => Ok(Severity::Low),
            "normal" => Ok(Severity::Normal),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

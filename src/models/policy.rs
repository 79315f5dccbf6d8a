use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::outcome::{Outcome, Severity};

/// Expression syntax used when a dependency does not name one.
pub const DEFAULT_SYNTAX: &str = "twig";

fn default_syntax() -> String {
    DEFAULT_SYNTAX.to_string()
}

// ============================================================================
// Dependency Behaviour
// ============================================================================

/// Disposition applied when a dependency is not met.
///
/// Variants are declared in precedence order, so `Ord` is the reconciliation
/// rank: when several dependencies fail, the highest-ranked behaviour wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyBehaviour {
    Pass,
    #[default]
    Fail,
    ReportOnly,
    Error,
    Omit,
}

impl DependencyBehaviour {
    pub fn rank(self) -> u8 {
        match self {
            DependencyBehaviour::Pass => 0,
            DependencyBehaviour::Fail => 1,
            DependencyBehaviour::ReportOnly => 2,
            DependencyBehaviour::Error => 3,
            DependencyBehaviour::Omit => 4,
        }
    }

    /// Outcome that replaces the guarded check, or `None` when it should run.
    pub fn outcome(self) -> Option<Outcome> {
        match self {
            DependencyBehaviour::Pass => None,
            DependencyBehaviour::Fail => Some(Outcome::Failure),
            DependencyBehaviour::ReportOnly => Some(Outcome::NotApplicable),
            DependencyBehaviour::Error => Some(Outcome::Error),
            DependencyBehaviour::Omit => Some(Outcome::Irrelevant),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DependencyBehaviour::Pass => "PASS",
            DependencyBehaviour::Fail => "FAIL",
            DependencyBehaviour::ReportOnly => "REPORT_ONLY",
            DependencyBehaviour::Error => "ERROR",
            DependencyBehaviour::Omit => "OMIT",
        }
    }
}

// ============================================================================
// Policy Types
// ============================================================================

/// A guard expression gating execution of a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    /// Expression, interpolated then evaluated against the audit contexts
    pub expression: String,
    /// Expression syntax tag
    #[serde(default = "default_syntax")]
    pub syntax: String,
    /// Behaviour applied when the expression is not satisfied
    #[serde(default)]
    pub on_fail: DependencyBehaviour,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
}

impl Dependency {
    pub fn new(expression: impl Into<String>, on_fail: DependencyBehaviour) -> Self {
        Self {
            expression: expression.into(),
            syntax: default_syntax(),
            on_fail,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Description, falling back to the expression itself.
    pub fn label(&self) -> &str {
        if self.description.is_empty() {
            &self.expression
        } else {
            &self.description
        }
    }
}

/// A parameter computed from an expression before the check runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildParameter {
    pub name: String,
    pub expression: String,
}

/// A named, parameterized check definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique policy name
    pub name: String,
    /// Display title
    #[serde(default)]
    pub title: String,
    /// Identifier of the check implementation
    pub class: String,
    #[serde(default)]
    pub severity: Severity,
    /// Policy-level dependencies, checked before the policy runs
    #[serde(default)]
    pub depends: Vec<Dependency>,
    /// Evaluated in order; each result is visible to later expressions
    #[serde(default)]
    pub build_parameters: Vec<BuildParameter>,
    /// Execution parameters handed to the check
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl Policy {
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: String::new(),
            class: class.into(),
            severity: Severity::default(),
            depends: Vec::new(),
            build_parameters: Vec::new(),
            parameters: Map::new(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.depends.push(dependency);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_build_parameter(
        mut self,
        name: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        self.build_parameters.push(BuildParameter {
            name: name.into(),
            expression: expression.into(),
        });
        self
    }
}

// ============================================================================
// Profile
// ============================================================================

/// An audit profile: gating dependency policies plus the policies to assess.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub title: String,
    /// Profile-level dependencies, evaluated before any assessment
    #[serde(default)]
    pub dependencies: Vec<Policy>,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load a profile from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read profile: {:?}", path))?;
        Self::from_yaml(&content).context(format!("Failed to parse profile: {:?}", path))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let profile: Profile = serde_yaml::from_str(content)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Policy names must be unique within `dependencies` and within `policies`;
    /// reports key their results by name.
    pub fn validate(&self) -> Result<()> {
        for (section, policies) in [
            ("dependencies", &self.dependencies),
            ("policies", &self.policies),
        ] {
            let mut seen = HashSet::new();
            for policy in policies {
                if !seen.insert(policy.name.as_str()) {
                    anyhow::bail!(
                        "Duplicate policy name in profile {} {}: {}",
                        self.name,
                        section,
                        policy.name
                    );
                }
            }
        }
        Ok(())
    }

    /// Select assessment policies by name, in the order requested.
    pub fn select(&self, names: &[String]) -> Result<Vec<Policy>> {
        names
            .iter()
            .map(|name| {
                self.policies
                    .iter()
                    .find(|p| &p.name == name)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("Policy not found in profile: {}", name))
            })
            .collect()
    }
}

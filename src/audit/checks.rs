//! Built-in check implementations.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};

use crate::expression::is_truthy;
use crate::models::{DEFAULT_SYNTAX, Outcome, Policy};
use crate::target::CAPABILITY_SHELL;

use super::{AuditContext, AuditError, Checker, Prepared};

// ============================================================================
// Analysis
// ============================================================================

/// Evaluates an expression over the target properties and parameters.
///
/// Parameters:
/// - `expression`: pass condition
/// - `not_applicable`: optional; when truthy the policy does not apply
/// - `warning`: report a failure as `WARNING_FAIL`
/// - `syntax`: expression syntax tag
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisCheck;

#[async_trait]
impl Checker for AnalysisCheck {
    fn name(&self) -> &str {
        "analysis"
    }

    fn description(&self) -> &str {
        "Evaluate an expression against the target"
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["expression"],
            "properties": {
                "expression": { "type": "string" },
                "not_applicable": { "type": "string" },
                "warning": { "type": "boolean", "default": false },
                "syntax": { "type": "string", "default": DEFAULT_SYNTAX }
            }
        })
    }

    async fn run(&self, ctx: &mut AuditContext<'_>) -> Result<Outcome, AuditError> {
        let syntax = ctx.parameter_str("syntax").unwrap_or(DEFAULT_SYNTAX).to_string();

        if let Some(condition) = ctx.parameter_str("not_applicable").map(str::to_string) {
            if is_truthy(&ctx.evaluate_with(&condition, &syntax)?) {
                return Ok(Outcome::NotApplicable);
            }
        }

        let expression = ctx.require_str("expression")?.to_string();
        let result = ctx.evaluate_with(&expression, &syntax)?;
        ctx.set("result", result.clone());

        Ok(match (is_truthy(&result), ctx.parameter_bool("warning")) {
            (true, _) => Outcome::Success,
            (false, true) => Outcome::WarningFail,
            (false, false) => Outcome::Failure,
        })
    }
}

// ============================================================================
// Command
// ============================================================================

/// Runs a shell command on the target and inspects its output.
///
/// Output is cached per batch, and policies sharing a command are grouped into
/// the same worker so the command runs once.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandCheck;

#[async_trait]
impl Checker for CommandCheck {
    fn name(&self) -> &str {
        "command"
    }

    fn description(&self) -> &str {
        "Run a command on the target and match its output"
    }

    fn required_capabilities(&self) -> &[&'static str] {
        &[CAPABILITY_SHELL]
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": { "type": "string", "minLength": 1 },
                "pattern": { "type": "string" },
                "expression": { "type": "string" }
            }
        })
    }

    fn prepare(&self, policy: &Policy) -> Prepared {
        match policy.parameters.get("command").and_then(Value::as_str) {
            Some(command) => Prepared::Group(format!("command:{}", command)),
            None => Prepared::Individual,
        }
    }

    async fn run(&self, ctx: &mut AuditContext<'_>) -> Result<Outcome, AuditError> {
        let template = ctx.require_str("command")?.to_string();
        let command = ctx.interpolate(&template)?;
        let output = ctx.execute_cached(&command).await?;
        ctx.set("command", command);
        ctx.set("output", output.clone());

        let mut passed = true;

        if let Some(pattern) = ctx.parameter_str("pattern").map(str::to_string) {
            let re = Regex::new(&pattern).map_err(|e| AuditError::InvalidInput {
                message: format!("invalid pattern '{}': {}", pattern, e),
                upgrade_hint: Some(
                    "The policy's `pattern` parameter must be a valid regular expression"
                        .to_string(),
                ),
            })?;
            let matched = re.is_match(&output);
            ctx.set("matched", matched);
            passed &= matched;
        }

        if let Some(expression) = ctx.parameter_str("expression").map(str::to_string) {
            let result = ctx.evaluate(&expression)?;
            ctx.set("result", result.clone());
            passed &= is_truthy(&result);
        }

        Ok(Outcome::from(passed))
    }
}

// ============================================================================
// Notice
// ============================================================================

/// Always reports a `NOTICE` carrying a rendered message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoticeCheck;

#[async_trait]
impl Checker for NoticeCheck {
    fn name(&self) -> &str {
        "notice"
    }

    fn description(&self) -> &str {
        "Report an informational message"
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string", "default": "" }
            }
        })
    }

    async fn run(&self, ctx: &mut AuditContext<'_>) -> Result<Outcome, AuditError> {
        let template = ctx.parameter_str("message").unwrap_or_default().to_string();
        let message = ctx.interpolate(&template)?;
        ctx.set("message", message);
        Ok(Outcome::Notice)
    }
}

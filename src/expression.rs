//! Expression evaluation and template interpolation.
//!
//! Dependencies, build parameters and the built-in checks all go through the
//! [`ExpressionEngine`] seam. The default engine is backed by minijinja, which
//! accepts the Twig-style expressions policies are written in.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::Outcome;

/// Named values expressions are evaluated against.
pub type Contexts = Map<String, Value>;

#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("unsupported expression syntax '{0}'")]
    UnsupportedSyntax(String),
    #[error("failed to compile expression '{expression}': {message}")]
    Compile { expression: String, message: String },
    #[error("failed to evaluate expression '{expression}': {message}")]
    Evaluate { expression: String, message: String },
    #[error("failed to interpolate template '{template}': {message}")]
    Template { template: String, message: String },
}

/// Evaluates expressions and interpolates templates against contexts.
pub trait ExpressionEngine: Send + Sync {
    fn evaluate(
        &self,
        expression: &str,
        syntax: &str,
        contexts: &Contexts,
    ) -> Result<Value, ExpressionError>;

    fn interpolate(&self, template: &str, contexts: &Contexts) -> Result<String, ExpressionError>;
}

// ============================================================================
// MiniJinja Engine
// ============================================================================

/// Syntaxes understood by [`MiniJinjaEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    Twig,
    Jinja,
}

impl Syntax {
    pub fn parse(tag: &str) -> Result<Self, ExpressionError> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "" | "twig" => Ok(Syntax::Twig),
            "jinja" | "jinja2" => Ok(Syntax::Jinja),
            other => Err(ExpressionError::UnsupportedSyntax(other.to_string())),
        }
    }
}

/// Expression engine backed by minijinja with strict undefined handling.
pub struct MiniJinjaEngine {
    env: Environment<'static>,
}

impl Default for MiniJinjaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MiniJinjaEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }
}

impl ExpressionEngine for MiniJinjaEngine {
    fn evaluate(
        &self,
        expression: &str,
        syntax: &str,
        contexts: &Contexts,
    ) -> Result<Value, ExpressionError> {
        // Both syntaxes share the minijinja expression grammar.
        Syntax::parse(syntax)?;

        let compiled =
            self.env
                .compile_expression(expression)
                .map_err(|e| ExpressionError::Compile {
                    expression: expression.to_string(),
                    message: e.to_string(),
                })?;

        let evaluate_error = |message: String| ExpressionError::Evaluate {
            expression: expression.to_string(),
            message,
        };

        let value = compiled
            .eval(contexts)
            .map_err(|e| evaluate_error(e.to_string()))?;
        serde_json::to_value(&value).map_err(|e| evaluate_error(e.to_string()))
    }

    fn interpolate(&self, template: &str, contexts: &Contexts) -> Result<String, ExpressionError> {
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(template.to_string());
        }
        self.env
            .render_str(template, contexts)
            .map_err(|e| ExpressionError::Template {
                template: template.to_string(),
                message: e.to_string(),
            })
    }
}

// ============================================================================
// Context Helpers
// ============================================================================

/// Strict truthiness used for gating: only `true` or the number `1`.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() == Some(1.0),
        _ => false,
    }
}

/// Map of outcome names to their integer codes, exposed as `state`.
pub fn state_context() -> Value {
    let states: Map<String, Value> = Outcome::ALL
        .into_iter()
        .map(|o| (o.name().to_string(), Value::from(o.code())))
        .collect();
    Value::Object(states)
}

/// Insert `value` into a nested object tree at a dotted `path`.
pub fn insert_path(tree: &mut Value, path: &str, value: Value) {
    let mut node = tree;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Look up a dotted `path` in a nested object tree.
pub fn lookup_path<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(tree, |node, segment| node.as_object()?.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contexts() -> Contexts {
        let mut contexts = Contexts::new();
        contexts.insert(
            "target".to_string(),
            json!({"os": "linux", "php": {"version": "8.2"}, "cores": 4}),
        );
        contexts.insert("state".to_string(), state_context());
        contexts
    }

    #[test]
    fn test_evaluate_comparisons() {
        let engine = MiniJinjaEngine::new();
        let ctx = contexts();

        let value = engine
            .evaluate("target.os == 'linux'", "twig", &ctx)
            .unwrap();
        assert_eq!(value, json!(true));

        let value = engine.evaluate("target.cores * 2", "jinja", &ctx).unwrap();
        assert_eq!(value, json!(8));

        let value = engine.evaluate("state.ERROR", "twig", &ctx).unwrap();
        assert_eq!(value, json!(16));
    }

    #[test]
    fn test_undefined_variable_is_an_error() {
        let engine = MiniJinjaEngine::new();
        let result = engine.evaluate("missing.value == 1", "twig", &contexts());
        assert!(matches!(result, Err(ExpressionError::Evaluate { .. })));
    }

    #[test]
    fn test_unsupported_syntax() {
        let engine = MiniJinjaEngine::new();
        let result = engine.evaluate("1 == 1", "expression_language", &contexts());
        assert!(matches!(result, Err(ExpressionError::UnsupportedSyntax(_))));
    }

    #[test]
    fn test_interpolate() {
        let engine = MiniJinjaEngine::new();
        let ctx = contexts();

        let rendered = engine
            .interpolate("target.php.version == '{{ target.php.version }}'", &ctx)
            .unwrap();
        assert_eq!(rendered, "target.php.version == '8.2'");

        let plain = engine.interpolate("target.cores > 2", &ctx).unwrap();
        assert_eq!(plain, "target.cores > 2");
    }

    #[test]
    fn test_truthiness_is_strict() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!(1.0)));
        assert!(!is_truthy(&json!(2)));
        assert!(!is_truthy(&json!("yes")));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(null)));
    }

    #[test]
    fn test_insert_and_lookup_path() {
        let mut tree = json!({});
        insert_path(&mut tree, "php.version", json!("8.2"));
        insert_path(&mut tree, "php.sapi", json!("fpm"));
        insert_path(&mut tree, "os", json!("linux"));

        assert_eq!(tree, json!({"php": {"version": "8.2", "sapi": "fpm"}, "os": "linux"}));
        assert_eq!(lookup_path(&tree, "php.sapi"), Some(&json!("fpm")));
        assert_eq!(lookup_path(&tree, "php.missing"), None);
        assert_eq!(lookup_path(&tree, "os.deeper"), None);
    }
}

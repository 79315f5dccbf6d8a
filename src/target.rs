use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::expression::{insert_path, lookup_path};

/// Capability every shell-backed target provides.
pub const CAPABILITY_SHELL: &str = "shell";

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("command `{command}` exited with status {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("target '{target}' cannot execute commands")]
    ExecutionUnsupported { target: String },
    #[error("failed to run command: {0}")]
    Io(#[from] std::io::Error),
}

/// The system under audit.
#[async_trait]
pub trait Target: Send + Sync {
    fn name(&self) -> &str;

    /// Capability tags checks can require (e.g. `shell`).
    fn capabilities(&self) -> Vec<String>;

    /// Property at a dotted path.
    fn property(&self, path: &str) -> Option<Value>;

    /// Dotted paths of every leaf property.
    fn property_list(&self) -> Vec<String>;

    /// All properties as a nested tree.
    fn properties(&self) -> Value {
        let mut tree = Value::Object(Map::new());
        for path in self.property_list() {
            if let Some(value) = self.property(&path) {
                insert_path(&mut tree, &path, value);
            }
        }
        tree
    }

    fn has_capability(&self, capability: &str) -> bool {
        self.capabilities().iter().any(|c| c == capability)
    }

    async fn execute(&self, command: &str) -> Result<String, TargetError>;
}

// ============================================================================
// Local Target
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct TargetDefinition {
    name: String,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    properties: Value,
}

/// Target describing the local machine; commands run through `sh -c`.
#[derive(Debug, Clone)]
pub struct LocalTarget {
    name: String,
    capabilities: Vec<String>,
    properties: Value,
}

impl LocalTarget {
    pub fn new(name: impl Into<String>, properties: Value) -> Self {
        Self {
            name: name.into(),
            capabilities: vec![CAPABILITY_SHELL.to_string()],
            properties,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        let capability = capability.into();
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    /// Load a target description from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read target: {:?}", path))?;
        Self::from_yaml(&content).context(format!("Failed to parse target: {:?}", path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let definition: TargetDefinition = serde_yaml::from_str(content)?;
        let properties = match definition.properties {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let target = definition
            .capabilities
            .into_iter()
            .fold(Self::new(definition.name, properties), |t, c| {
                t.with_capability(c)
            });
        Ok(target)
    }
}

fn collect_leaves(prefix: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                collect_leaves(&path, child, out);
            }
        }
        _ if !prefix.is_empty() => out.push(prefix.to_string()),
        _ => {}
    }
}

#[async_trait]
impl Target for LocalTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    fn property(&self, path: &str) -> Option<Value> {
        lookup_path(&self.properties, path).cloned()
    }

    fn property_list(&self) -> Vec<String> {
        let mut paths = Vec::new();
        collect_leaves("", &self.properties, &mut paths);
        paths
    }

    fn properties(&self) -> Value {
        self.properties.clone()
    }

    async fn execute(&self, command: &str) -> Result<String, TargetError> {
        debug!(target_name = %self.name, command, "executing command");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await?;

        if !output.status.success() {
            return Err(TargetError::CommandFailed {
                command: command.to_string(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .trim_end_matches('\n')
            .to_string())
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::manifest::{Manifest, ManifestEntry};

/// The three capability families a manifest may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Workflow,
    RuntimeTool,
    ExecutionPattern,
}

impl CapabilityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityKind::Workflow => "workflow",
            CapabilityKind::RuntimeTool => "runtime_tool",
            CapabilityKind::ExecutionPattern => "execution_pattern",
        }
    }

    /// Maps a kind string to the enum, treating anything unrecognised as an
    /// execution pattern.
    pub fn parse_lossy(value: &str) -> Self {
        match value {
            "workflow" => CapabilityKind::Workflow,
            "runtime_tool" => CapabilityKind::RuntimeTool,
            _ => CapabilityKind::ExecutionPattern,
        }
    }
}

/// Declared type of one workflow argument, with integer bounds attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Integer {
        minimum: Option<i64>,
        maximum: Option<i64>,
    },
    Boolean,
    Unsupported(String),
}

/// Schema for one named workflow argument.
///
/// Unknown `type` strings load fine and only fail when a value is coerced
/// against them, so a manifest can describe argument types this build does
/// not understand without breaking startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgSpec {
    #[serde(rename = "type", default)]
    pub arg_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub minimum: Option<i64>,
    #[serde(default)]
    pub maximum: Option<i64>,
}

impl ArgSpec {
    pub fn kind(&self) -> ArgKind {
        match self.arg_type.as_str() {
            "string" => ArgKind::String,
            "integer" => ArgKind::Integer {
                minimum: self.minimum,
                maximum: self.maximum,
            },
            "boolean" => ArgKind::Boolean,
            other => ArgKind::Unsupported(other.to_string()),
        }
    }
}

/// Full capability document returned by `read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDoc {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arg_schema: BTreeMap<String, ArgSpec>,
    #[serde(default)]
    pub examples: Vec<Value>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub expected_output_shape: serde_json::Map<String, Value>,
}

/// Short-form capability descriptor used in list and search views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityHit {
    pub id: String,
    pub kind: CapabilityKind,
    pub summary: String,
    pub when_to_use: String,
    #[serde(default)]
    pub required_args: Vec<String>,
    pub example: String,
}

/// What the execution layer needs to know about one workflow: where its
/// payload script lives and what arguments it takes.
#[derive(Debug, Clone)]
pub struct WorkflowSpec {
    pub id: String,
    pub script_path: Option<String>,
    pub arg_schema: BTreeMap<String, ArgSpec>,
}

/// Immutable id-keyed index over the manifest's workflow section.
#[derive(Debug, Clone, Default)]
pub struct WorkflowIndex {
    workflows: BTreeMap<String, WorkflowSpec>,
}

impl WorkflowIndex {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let mut workflows = BTreeMap::new();
        for entry in &manifest.workflows {
            if entry.id.is_empty() {
                continue;
            }
            workflows.insert(entry.id.clone(), workflow_spec(entry));
        }
        Self { workflows }
    }

    pub fn get(&self, workflow_id: &str) -> Option<&WorkflowSpec> {
        self.workflows.get(workflow_id)
    }

    /// All known workflow ids in sorted order, for "unknown workflow" errors.
    pub fn ids(&self) -> Vec<&str> {
        self.workflows.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

fn workflow_spec(entry: &ManifestEntry) -> WorkflowSpec {
    WorkflowSpec {
        id: entry.id.clone(),
        script_path: entry.script_path.clone(),
        arg_schema: entry.arg_schema.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parse_falls_back_to_execution_pattern() {
        assert_eq!(CapabilityKind::parse_lossy("workflow"), CapabilityKind::Workflow);
        assert_eq!(
            CapabilityKind::parse_lossy("runtime_tool"),
            CapabilityKind::RuntimeTool
        );
        assert_eq!(
            CapabilityKind::parse_lossy("something_new"),
            CapabilityKind::ExecutionPattern
        );
    }

    #[test]
    fn arg_spec_kind_carries_bounds_and_flags_unsupported_types() {
        let spec = ArgSpec {
            arg_type: "integer".to_string(),
            minimum: Some(0),
            maximum: Some(2),
            ..ArgSpec::default()
        };
        assert_eq!(
            spec.kind(),
            ArgKind::Integer {
                minimum: Some(0),
                maximum: Some(2)
            }
        );

        let spec = ArgSpec {
            arg_type: "float".to_string(),
            ..ArgSpec::default()
        };
        assert_eq!(spec.kind(), ArgKind::Unsupported("float".to_string()));
    }
}

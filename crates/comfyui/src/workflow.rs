//! Workflow templates in ComfyUI's API (prompt) format.
//!
//! A template is a JSON object keyed by node id, each node carrying an
//! `inputs` object. Submission overwrites a few named input slots with
//! caller-supplied values and leaves the rest of the graph untouched.

use std::path::{Path, PathBuf};

/// One writable input: `graph[node].inputs[field]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub node: String,
    pub field: String,
}

impl Slot {
    pub fn new(node: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            field: field.into(),
        }
    }
}

/// A parsed workflow graph, shared read-only between submissions.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    graph: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Failed to read workflow {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Workflow is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Workflow must be a JSON object keyed by node id")]
    NotAnObject,

    #[error("Workflow has no node {0}")]
    MissingNode(String),

    #[error("Workflow node {0} has no inputs object")]
    MissingInputs(String),
}

impl WorkflowTemplate {
    /// Read and parse a template file.
    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let text = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_value(serde_json::from_str(&text)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, WorkflowError> {
        match value {
            serde_json::Value::Object(graph) => Ok(Self { graph }),
            _ => Err(WorkflowError::NotAnObject),
        }
    }

    /// Copy the graph with each slot overwritten by its value.
    ///
    /// Every slot's node must exist and carry an `inputs` object; the
    /// field itself may be new.
    pub fn fill(&self, values: &[(Slot, serde_json::Value)]) -> Result<serde_json::Value, WorkflowError> {
        let mut graph = self.graph.clone();

        for (slot, value) in values {
            let node = graph
                .get_mut(&slot.node)
                .ok_or_else(|| WorkflowError::MissingNode(slot.node.clone()))?;
            let inputs = node
                .get_mut("inputs")
                .and_then(serde_json::Value::as_object_mut)
                .ok_or_else(|| WorkflowError::MissingInputs(slot.node.clone()))?;
            inputs.insert(slot.field.clone(), value.clone());
        }

        Ok(serde_json::Value::Object(graph))
    }
}

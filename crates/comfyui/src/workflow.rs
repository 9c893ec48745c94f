//! API-format workflow documents.
//!
//! A workflow is a JSON object keyed by node id; each node carries a
//! `class_type` and an `inputs` object. Jobs load a template from disk and
//! patch individual inputs before submitting it.

use std::path::Path;

use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Failed to read workflow template: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid workflow JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Workflow must be a JSON object keyed by node id")]
    NotAnObject,

    #[error("Workflow has no node {0}")]
    MissingNode(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    nodes: Map<String, Value>,
}

impl Workflow {
    pub fn from_value(value: Value) -> Result<Self, WorkflowError> {
        match value {
            Value::Object(nodes) => Ok(Self { nodes }),
            _ => Err(WorkflowError::NotAnObject),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, WorkflowError> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    pub async fn load(path: &Path) -> Result<Self, WorkflowError> {
        let bytes = tokio::fs::read(path).await?;
        Self::from_slice(&bytes)
    }

    /// Set `inputs.<name>` on node `node_id`, creating `inputs` if absent.
    pub fn set_input(
        &mut self,
        node_id: &str,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<(), WorkflowError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| WorkflowError::MissingNode(node_id.to_string()))?;

        let inputs = node
            .entry("inputs")
            .or_insert_with(|| Value::Object(Map::new()));
        if !inputs.is_object() {
            *inputs = Value::Object(Map::new());
        }
        if let Value::Object(inputs) = inputs {
            inputs.insert(name.to_string(), value.into());
        }
        Ok(())
    }

    pub fn input(&self, node_id: &str, name: &str) -> Option<&Value> {
        self.nodes.get(node_id)?.get("inputs")?.get(name)
    }

    pub fn class_type(&self, node_id: &str) -> Option<&str> {
        self.nodes.get(node_id)?.get("class_type")?.as_str()
    }

    /// Ids of nodes whose `class_type` equals `class`.
    pub fn nodes_of_class(&self, class: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.get("class_type").and_then(Value::as_str) == Some(class))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.nodes.clone())
    }
}

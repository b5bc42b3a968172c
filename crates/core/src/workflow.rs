//! Typed model of a ComfyUI API-format workflow graph.
//!
//! The wire format is an object keyed by node ID:
//!
//! ```json
//! {
//!   "3": {
//!     "class_type": "KSampler",
//!     "inputs": { "seed": 42, "model": ["4", 0] }
//!   }
//! }
//! ```
//!
//! A two-element `[node_id, output_index]` array inside `inputs` is an edge
//! to another node's output. It is decoded into [`InputValue::Link`] so that
//! edges are never confused with genuine array parameters.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::validation;

// ---------------------------------------------------------------------------
// Node references and input values
// ---------------------------------------------------------------------------

/// Reference to output slot `output_index` of node `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub node_id: String,
    pub output_index: u64,
}

/// A single node input: either an edge or a literal JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum InputValue {
    Link(NodeRef),
    Literal(Value),
}

impl From<Value> for InputValue {
    fn from(value: Value) -> Self {
        if let Some([source, slot]) = value.as_array().map(Vec::as_slice) {
            if let (Some(node_id), Some(output_index)) = (source.as_str(), slot.as_u64()) {
                return InputValue::Link(NodeRef {
                    node_id: node_id.to_string(),
                    output_index,
                });
            }
        }
        InputValue::Literal(value)
    }
}

impl From<InputValue> for Value {
    fn from(value: InputValue) -> Self {
        match value {
            InputValue::Link(link) => {
                Value::Array(vec![Value::String(link.node_id), Value::from(link.output_index)])
            }
            InputValue::Literal(v) => v,
        }
    }
}

impl InputValue {
    /// The literal value, or `None` for a link.
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            InputValue::Literal(v) => Some(v),
            InputValue::Link(_) => None,
        }
    }

    pub fn as_link(&self) -> Option<&NodeRef> {
        match self {
            InputValue::Link(link) => Some(link),
            InputValue::Literal(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// One processing step of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Server-side node class, e.g. `KSampler`.
    pub class_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<BTreeMap<String, InputValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widgets_values: Option<Vec<Value>>,
    /// Any other keys (`_meta`, editor hints, ...), preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkflowNode {
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            class_type: class_type.into(),
            inputs: None,
            widgets_values: None,
            extra: Map::new(),
        }
    }

    /// Builder-style helper for setting a literal input.
    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.inputs_mut().insert(name.into(), value.into());
        self
    }

    /// Input map, created empty on first access.
    pub fn inputs_mut(&mut self) -> &mut BTreeMap<String, InputValue> {
        self.inputs.get_or_insert_with(BTreeMap::new)
    }

    pub fn input(&self, name: &str) -> Option<&InputValue> {
        self.inputs.as_ref().and_then(|inputs| inputs.get(name))
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// An edge from one node's output slot into another node's named input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub from: NodeRef,
    pub to_node: String,
    pub to_input: String,
}

/// Node-ID keyed workflow graph, serialized exactly as the server expects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowGraph {
    nodes: BTreeMap<String, WorkflowNode>,
}

impl WorkflowGraph {
    /// Validate raw JSON text and decode it into a graph.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        validation::validate(raw).into_result()?;
        serde_json::from_str(raw).map_err(|e| CoreError::Validation(format!("Invalid JSON: {e}")))
    }

    /// Validate an already-parsed JSON value and decode it into a graph.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        validation::validate_value(&value).into_result()?;
        serde_json::from_value(value)
            .map_err(|e| CoreError::Validation(format!("Invalid workflow: {e}")))
    }

    pub fn to_value(&self) -> Value {
        // A map of plain structs with string keys always serializes.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, node_id: impl Into<String>, node: WorkflowNode) {
        self.nodes.insert(node_id.into(), node);
    }

    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut WorkflowNode> {
        self.nodes.get_mut(node_id)
    }

    /// Nodes in graph order (see [`compare_node_ids`]).
    pub fn iter(&self) -> impl Iterator<Item = (&String, &WorkflowNode)> {
        let mut entries: Vec<_> = self.nodes.iter().collect();
        entries.sort_by(|a, b| compare_node_ids(a.0, b.0));
        entries.into_iter()
    }

    /// Every edge in the graph.
    pub fn links(&self) -> Vec<Link> {
        let mut links = Vec::new();
        for (node_id, node) in self.iter() {
            let Some(inputs) = &node.inputs else {
                continue;
            };
            for (input_name, value) in inputs {
                if let InputValue::Link(from) = value {
                    links.push(Link {
                        from: from.clone(),
                        to_node: node_id.clone(),
                        to_input: input_name.clone(),
                    });
                }
            }
        }
        links
    }

    /// Edges whose source node does not exist in this graph.
    pub fn dangling_links(&self) -> Vec<Link> {
        self.links()
            .into_iter()
            .filter(|link| !self.nodes.contains_key(&link.from.node_id))
            .collect()
    }
}

/// Ordering used whenever nodes are walked: numeric IDs ascending by value,
/// then any non-numeric IDs lexicographically.
pub fn compare_node_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

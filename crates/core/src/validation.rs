//! Structural validation of workflow JSON before it is sent anywhere.
//!
//! Size and nesting depth are checked on the raw text first so that parse
//! cost stays bounded for hostile input. Validation is fail-fast: the first
//! violation found is reported, qualified by node ID where applicable.

use serde::Serialize;
use serde_json::Value;

use crate::error::CoreError;
use crate::workflow::compare_node_ids;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Maximum workflow JSON size in bytes (1 MB).
pub const MAX_WORKFLOW_JSON_BYTES: usize = 1_000_000;

/// Maximum nesting depth of objects/arrays in workflow JSON.
pub const MAX_WORKFLOW_JSON_DEPTH: usize = 100;

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// Outcome of validating a candidate workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(message.into()),
        }
    }

    pub fn into_result(self) -> Result<(), CoreError> {
        match self.error {
            Some(message) if !self.valid => Err(CoreError::Validation(message)),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Public functions
// ---------------------------------------------------------------------------

/// Validate raw workflow JSON text.
pub fn validate(raw: &str) -> ValidationResult {
    if raw.trim().is_empty() {
        return ValidationResult::invalid("Workflow JSON must not be empty");
    }

    if raw.len() > MAX_WORKFLOW_JSON_BYTES {
        return ValidationResult::invalid(format!(
            "Workflow JSON is {} bytes, exceeding the limit of {MAX_WORKFLOW_JSON_BYTES} bytes",
            raw.len()
        ));
    }

    let depth = json_nesting_depth(raw);
    if depth > MAX_WORKFLOW_JSON_DEPTH {
        return ValidationResult::invalid(format!(
            "Workflow JSON nesting depth {depth} exceeds the maximum of {MAX_WORKFLOW_JSON_DEPTH}"
        ));
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(value) => validate_value(&value),
        Err(e) => ValidationResult::invalid(format!("Invalid JSON: {e}")),
    }
}

/// Validate an already-parsed workflow value (structure only).
pub fn validate_value(value: &Value) -> ValidationResult {
    let obj = match value {
        Value::Object(obj) => obj,
        other => {
            return ValidationResult::invalid(format!(
                "Workflow JSON must be an object, got {}",
                describe(other)
            ))
        }
    };

    if obj.is_empty() {
        return ValidationResult::invalid("Workflow JSON must contain at least one node");
    }

    let mut node_ids: Vec<&String> = obj.keys().collect();
    node_ids.sort_by(|a, b| compare_node_ids(a, b));

    for node_id in node_ids {
        if let Err(message) = validate_node(node_id, &obj[node_id.as_str()]) {
            return ValidationResult::invalid(message);
        }
    }

    ValidationResult::ok()
}

/// Maximum object/array nesting depth of raw JSON text.
///
/// Brackets inside string literals (including escaped quotes) are ignored.
/// The text does not need to be valid JSON.
pub fn json_nesting_depth(raw: &str) -> usize {
    let mut depth = 0usize;
    let mut max_depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for byte in raw.bytes() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }

    max_depth
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_node(node_id: &str, node: &Value) -> Result<(), String> {
    let node = node
        .as_object()
        .ok_or_else(|| format!("Node '{node_id}' must be an object, got {}", describe(node)))?;

    match node.get("class_type") {
        None => {
            return Err(format!(
                "Node '{node_id}' is missing required 'class_type' field"
            ))
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            return Err(format!("Node '{node_id}' has an empty 'class_type'"))
        }
        Some(Value::String(_)) => {}
        Some(other) => {
            return Err(format!(
                "Node '{node_id}' has a non-string 'class_type' ({})",
                describe(other)
            ))
        }
    }

    if let Some(inputs) = node.get("inputs") {
        if !inputs.is_object() {
            return Err(format!(
                "Node '{node_id}' has 'inputs' that is not an object ({})",
                describe(inputs)
            ));
        }
    }

    if let Some(widgets) = node.get("widgets_values") {
        if !widgets.is_array() {
            return Err(format!(
                "Node '{node_id}' has 'widgets_values' that is not an array ({})",
                describe(widgets)
            ));
        }
    }

    Ok(())
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{WorkflowGraph, WorkflowNode};
    use serde_json::json;

    fn error_of(raw: &str) -> String {
        let result = validate(raw);
        assert!(!result.valid, "expected invalid: {raw}");
        result.error.unwrap()
    }

    #[test]
    fn minimal_workflow_is_valid() {
        let raw = r#"{"1": {"class_type": "SaveImage", "inputs": {"images": ["2", 0]}}}"#;
        assert_eq!(validate(raw), ValidationResult::ok());
    }

    #[test]
    fn serialized_graph_validates() {
        let mut graph = WorkflowGraph::default();
        graph.insert(
            "4",
            WorkflowNode::new("CheckpointLoaderSimple").with_input("ckpt_name", json!("a.ckpt")),
        );
        graph.insert(
            "9",
            WorkflowNode::new("SaveImage").with_input("images", json!(["4", 0])),
        );
        let raw = serde_json::to_string(&graph).unwrap();
        assert!(validate(&raw).valid);
    }

    #[test]
    fn rejects_blank_input() {
        assert!(error_of("").contains("must not be empty"));
        assert!(error_of("   \n\t").contains("must not be empty"));
    }

    #[test]
    fn rejects_oversized_payload() {
        let padding = "x".repeat(MAX_WORKFLOW_JSON_BYTES);
        let raw = format!(r#"{{"1": {{"class_type": "{padding}"}}}}"#);
        assert!(error_of(&raw).contains("exceeding the limit"));
    }

    #[test]
    fn rejects_over_deep_nesting() {
        let raw = format!("{}{}", "[".repeat(150), "]".repeat(150));
        assert!(error_of(&raw).contains("nesting depth 150"));
    }

    #[test]
    fn depth_scan_ignores_brackets_in_strings() {
        assert_eq!(json_nesting_depth(r#"{"a": "[[[{{{"}"#), 1);
        assert_eq!(json_nesting_depth(r#"{"a": "\"[["}"#), 1);
        assert_eq!(json_nesting_depth(r#"{"a": {"b": [1, [2]]}}"#), 4);
    }

    #[test]
    fn rejects_parse_failure_with_parser_message() {
        let message = error_of("{\"1\": ");
        assert!(message.starts_with("Invalid JSON:"), "{message}");
    }

    #[test]
    fn rejects_non_object_top_level() {
        assert!(error_of("[]").contains("got an array"));
        assert!(error_of("null").contains("got null"));
        assert!(error_of("\"workflow\"").contains("got a string"));
    }

    #[test]
    fn rejects_empty_object() {
        assert!(error_of("{}").contains("at least one node"));
    }

    #[test]
    fn rejects_non_object_node() {
        assert_eq!(
            error_of(r#"{"7": 12}"#),
            "Node '7' must be an object, got a number"
        );
    }

    #[test]
    fn rejects_missing_class_type() {
        assert_eq!(
            error_of(r#"{"3": {"inputs": {}}}"#),
            "Node '3' is missing required 'class_type' field"
        );
    }

    #[test]
    fn rejects_non_string_class_type() {
        assert!(error_of(r#"{"3": {"class_type": 5}}"#).contains("non-string 'class_type'"));
        assert!(error_of(r#"{"3": {"class_type": "  "}}"#).contains("empty 'class_type'"));
    }

    #[test]
    fn rejects_list_inputs() {
        assert!(error_of(r#"{"3": {"class_type": "KSampler", "inputs": [1, 2]}}"#)
            .contains("'inputs' that is not an object"));
    }

    #[test]
    fn rejects_non_array_widgets_values() {
        assert!(
            error_of(r#"{"3": {"class_type": "KSampler", "widgets_values": {"a": 1}}}"#)
                .contains("'widgets_values' that is not an array")
        );
    }

    #[test]
    fn reports_first_violation_in_node_order() {
        let raw = r#"{"10": {"inputs": {}}, "2": {"class_type": 1}}"#;
        assert!(error_of(raw).starts_with("Node '2'"));
    }

    #[test]
    fn into_result_maps_to_core_error() {
        assert!(ValidationResult::ok().into_result().is_ok());
        assert_eq!(
            ValidationResult::invalid("nope").into_result(),
            Err(CoreError::Validation("nope".into()))
        );
    }
}

//! Applying parameter overrides to a workflow graph.

use genrelay_core::overrides::{override_label, ParameterOverride, TypedValue};
use genrelay_core::workflow::{InputValue, WorkflowGraph};
use serde_json::Value;

use crate::error::ComfyUIError;
use crate::images::ImageResolver;

/// Apply overrides in order; later writes to the same input win.
///
/// The target node is checked before any image is resolved, so a bad node ID
/// never triggers an upload. Errors carry the 1-based override position.
pub async fn apply_overrides(
    graph: &mut WorkflowGraph,
    overrides: &[ParameterOverride],
    resolver: &ImageResolver<'_>,
) -> Result<(), ComfyUIError> {
    for (index, entry) in overrides.iter().enumerate() {
        apply_one(graph, entry, resolver)
            .await
            .map_err(|e| e.with_prefix(&override_label(index)))?;
    }
    Ok(())
}

async fn apply_one(
    graph: &mut WorkflowGraph,
    entry: &ParameterOverride,
    resolver: &ImageResolver<'_>,
) -> Result<(), ComfyUIError> {
    let node_id = entry.node_id();
    if graph.node(node_id).is_none() {
        return Err(ComfyUIError::Validation(format!(
            "Node '{node_id}' not found in workflow"
        )));
    }

    match entry {
        ParameterOverride::Single {
            param_name, value, ..
        } => {
            let literal = match value {
                TypedValue::Image(reference) => Value::String(resolver.resolve(reference).await?),
                other => other.as_literal().unwrap_or(Value::Null),
            };
            set_inputs(graph, node_id, [(param_name.clone(), InputValue::Literal(literal))]);
        }
        ParameterOverride::Bulk { parameters, .. } => {
            let inputs = parameters
                .iter()
                .map(|(name, value)| (name.clone(), InputValue::from(value.clone())));
            set_inputs(graph, node_id, inputs);
        }
    }

    tracing::debug!(node_id, "Applied override");
    Ok(())
}

fn set_inputs(
    graph: &mut WorkflowGraph,
    node_id: &str,
    inputs: impl IntoIterator<Item = (String, InputValue)>,
) {
    if let Some(node) = graph.node_mut(node_id) {
        node.inputs_mut().extend(inputs);
    }
}

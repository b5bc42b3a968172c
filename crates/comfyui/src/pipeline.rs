//! End-to-end run: validate, build, override, execute, fetch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use genrelay_core::execution::{ExecutionResult, ExecutionStatus};
use genrelay_core::overrides::{parse_override_records, BinaryStore, OverrideRecord, ParameterOverride, DEFAULT_BINARY_PROPERTY};
use genrelay_core::workflow::WorkflowGraph;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::client::ExecutionClient;
use crate::config::ExecutionConfig;
use crate::error::ComfyUIError;
use crate::observer::ExecutionObserver;
use crate::outputs::{fetch_outputs, summarize, BinaryOutput};
use crate::transport::HttpTransport;

/// Everything a caller supplies for one run.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    /// Workflow graph as raw JSON text.
    pub workflow_json: String,
    pub overrides: Vec<OverrideRecord>,
    /// Binary attachments referenced by image overrides.
    pub binaries: BinaryStore,
    /// Output key for the first artifact.
    pub primary_key: String,
}

impl WorkflowRequest {
    pub fn new(workflow_json: impl Into<String>) -> Self {
        Self {
            workflow_json: workflow_json.into(),
            overrides: Vec::new(),
            binaries: BinaryStore::new(),
            primary_key: DEFAULT_BINARY_PROPERTY.to_string(),
        }
    }
}

/// A completed run.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub result: ExecutionResult,
    pub outputs: BTreeMap<String, BinaryOutput>,
    pub summary: Value,
}

/// Run one workflow on a fresh client, destroying it afterwards.
///
/// Cancelling `cancel` aborts the run; the client works on a child token so
/// destroying it leaves the caller's token untouched.
pub async fn run_workflow(
    config: ExecutionConfig,
    transport: Arc<dyn HttpTransport>,
    request: WorkflowRequest,
    observer: Arc<dyn ExecutionObserver>,
    cancel: &CancellationToken,
) -> Result<WorkflowRun, ComfyUIError> {
    let graph = WorkflowGraph::parse(&request.workflow_json)?;
    let overrides = parse_override_records(request.overrides, &request.binaries)?;

    let client = ExecutionClient::new(config, transport)?
        .with_observer(observer)
        .with_cancellation_token(cancel.child_token());

    let run = execute_request(&client, graph, &overrides, &request.primary_key).await;
    client.destroy();
    run
}

/// Apply overrides, execute, and fetch outputs on an existing client.
pub async fn execute_request(
    client: &ExecutionClient,
    mut graph: WorkflowGraph,
    overrides: &[ParameterOverride],
    primary_key: &str,
) -> Result<WorkflowRun, ComfyUIError> {
    client.apply_overrides(&mut graph, overrides).await?;
    let result = client.execute(&graph).await?;

    match result.status {
        ExecutionStatus::Completed => {}
        ExecutionStatus::TimedOut => {
            return Err(ComfyUIError::Timeout {
                elapsed: Duration::from_millis(result.elapsed_ms),
            })
        }
        ExecutionStatus::Failed => {
            return Err(ComfyUIError::Execution(
                result.error.unwrap_or_else(|| "execution failed".into()),
            ))
        }
    }

    let outputs = fetch_outputs(client, &result, primary_key).await?;
    let summary = summarize(&result, client.config());
    Ok(WorkflowRun {
        result,
        outputs,
        summary,
    })
}

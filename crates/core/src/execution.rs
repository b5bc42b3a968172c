//! Execution lifecycle types shared by the client and its callers.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::artifacts::ExtractedOutputs;

/// Client lifecycle. Everything after `Polling` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Submitted,
    Polling,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::TimedOut
                | ExecutionState::Cancelled
        )
    }
}

/// How a finished execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    TimedOut,
}

/// Identifies one in-flight submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionHandle {
    pub prompt_id: String,
    pub client_id: String,
}

/// Outcome of one execution. Built once, never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    pub images: Vec<String>,
    pub videos: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn completed(prompt_id: impl Into<String>, outputs: ExtractedOutputs, elapsed_ms: u64) -> Self {
        Self {
            success: true,
            status: ExecutionStatus::Completed,
            prompt_id: Some(prompt_id.into()),
            images: outputs.images,
            videos: outputs.videos,
            raw_output: raw_output_value(outputs.raw_output),
            error: None,
            elapsed_ms,
        }
    }

    pub fn failed(prompt_id: Option<String>, error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            status: ExecutionStatus::Failed,
            prompt_id,
            images: Vec::new(),
            videos: Vec::new(),
            raw_output: None,
            error: Some(error.into()),
            elapsed_ms,
        }
    }

    /// `prompt_id` is `None` when the deadline passed before submission succeeded.
    pub fn timed_out(prompt_id: Option<String>, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            status: ExecutionStatus::TimedOut,
            prompt_id,
            images: Vec::new(),
            videos: Vec::new(),
            raw_output: None,
            error: Some(format!(
                "Execution timed out after {:.1}s without completing",
                elapsed_ms as f64 / 1000.0
            )),
            elapsed_ms,
        }
    }
}

fn raw_output_value(raw: Map<String, Value>) -> Option<Value> {
    if raw.is_empty() {
        None
    } else {
        Some(Value::Object(raw))
    }
}

//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`ComfyUIMessage`] enum and maps the ones that
//! concern a given prompt onto [`ExecutionEvent`]s.

use serde::Deserialize;

use crate::observer::ExecutionEvent;

/// All known ComfyUI WebSocket message types.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, etc.).
    #[serde(rename = "status")]
    Status(StatusData),

    #[serde(rename = "execution_start")]
    ExecutionStart(PromptData),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A specific node is currently executing (or execution finished when `node` is `None`).
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Progress update from a long-running node (e.g. KSampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    #[serde(rename = "executed")]
    Executed(ExecutedData),

    #[serde(rename = "execution_success")]
    ExecutionSuccess(PromptData),

    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(PromptData),

    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload carrying only the prompt it belongs to.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptData {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// When `node` is `None`, execution of the prompt has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Step-level progress within a node. Older servers omit `prompt_id`/`node`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i64,
    pub max: i64,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl ProgressData {
    pub fn percent(&self) -> u8 {
        if self.max <= 0 {
            return 0;
        }
        (self.value.clamp(0, self.max) * 100 / self.max) as u8
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    pub output: serde_json::Value,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    pub node_id: String,
    pub exception_message: String,
    pub exception_type: String,
}

impl ComfyUIMessage {
    /// Prompt the message refers to, when it names one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            ComfyUIMessage::Status(_) => None,
            ComfyUIMessage::ExecutionStart(d)
            | ComfyUIMessage::ExecutionSuccess(d)
            | ComfyUIMessage::ExecutionInterrupted(d) => Some(d.prompt_id.as_str()),
            ComfyUIMessage::ExecutionCached(d) => Some(d.prompt_id.as_str()),
            ComfyUIMessage::Executing(d) => d.prompt_id.as_deref(),
            ComfyUIMessage::Progress(d) => d.prompt_id.as_deref(),
            ComfyUIMessage::Executed(d) => Some(d.prompt_id.as_str()),
            ComfyUIMessage::ExecutionError(d) => Some(d.prompt_id.as_str()),
        }
    }

    /// Messages without a prompt ID are attributed to whatever is running.
    pub fn concerns(&self, prompt_id: &str) -> bool {
        self.prompt_id().map_or(true, |id| id == prompt_id)
    }

    /// Observer event for this message, if it is one worth forwarding.
    pub fn to_event(&self, prompt_id: &str) -> Option<ExecutionEvent> {
        if !self.concerns(prompt_id) {
            return None;
        }
        match self {
            ComfyUIMessage::Status(data) => Some(ExecutionEvent::QueueStatus {
                queue_remaining: data.status.exec_info.queue_remaining,
            }),
            ComfyUIMessage::ExecutionCached(data) if !data.nodes.is_empty() => {
                Some(ExecutionEvent::NodesCached {
                    prompt_id: prompt_id.to_string(),
                    nodes: data.nodes.clone(),
                })
            }
            ComfyUIMessage::Executed(data) => Some(ExecutionEvent::NodeExecuted {
                prompt_id: prompt_id.to_string(),
                node: data.node.clone(),
                output_keys: data
                    .output
                    .as_object()
                    .map(|output| output.keys().cloned().collect())
                    .unwrap_or_default(),
            }),
            ComfyUIMessage::ExecutionError(data) => Some(ExecutionEvent::NodeError {
                prompt_id: prompt_id.to_string(),
                node: data.node_id.clone(),
                exception_type: data.exception_type.clone(),
                message: data.exception_message.clone(),
            }),
            ComfyUIMessage::Progress(data) => Some(ExecutionEvent::Progress {
                node: data.node.clone(),
                value: data.value,
                max: data.max,
                percent: data.percent(),
            }),
            ComfyUIMessage::Executing(ExecutingData {
                node: Some(node), ..
            }) => Some(ExecutionEvent::NodeExecuting {
                prompt_id: prompt_id.to_string(),
                node: node.clone(),
            }),
            _ => None,
        }
    }

    /// Whether the prompt has stopped running on the server.
    pub fn ends(&self, prompt_id: &str) -> bool {
        self.concerns(prompt_id)
            && matches!(
                self,
                ComfyUIMessage::Executing(ExecutingData { node: None, .. })
                    | ComfyUIMessage::ExecutionSuccess(_)
                    | ComfyUIMessage::ExecutionInterrupted(_)
                    | ComfyUIMessage::ExecutionError(_)
            )
    }
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log unknown types and continue.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}

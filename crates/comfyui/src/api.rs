//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps workflow submission, history retrieval, image upload, artifact
//! download, queue cancellation, and system info on top of an
//! [`HttpTransport`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::transport::{HttpRequest, HttpResponse, HttpTransport, MultipartField, TransportError};

/// HTTP client for a single ComfyUI instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    transport: Arc<dyn HttpTransport>,
    api_url: String,
    request_timeout: Option<Duration>,
}

/// Response returned by the `/prompt` endpoint after successfully queuing a
/// workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation problems the server chose to tolerate.
    #[serde(default)]
    pub node_errors: Value,
}

/// Response from `/upload/image`.
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    /// Name the server stored the file under (may differ from the request).
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default, rename = "type")]
    pub file_type: String,
}

/// One prompt's entry in `/history`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: Value,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub status_str: Option<String>,
    /// `[event_name, payload]` pairs recorded during execution.
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// Where a history entry stands.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Pending,
    Completed,
    Errored(String),
}

impl HistoryEntry {
    /// Interpret the entry's status.
    ///
    /// Servers that omit `status` are treated as complete once outputs exist.
    pub fn completion(&self) -> Completion {
        match &self.status {
            Some(status) if status.status_str.as_deref() == Some("error") => {
                Completion::Errored(status.error_message())
            }
            Some(status) if status.completed => Completion::Completed,
            Some(_) => Completion::Pending,
            None if self.has_outputs() => Completion::Completed,
            None => Completion::Pending,
        }
    }

    fn has_outputs(&self) -> bool {
        self.outputs.as_object().is_some_and(|o| !o.is_empty())
    }
}

impl HistoryStatus {
    /// Message of the recorded `execution_error` event, if any.
    pub fn error_message(&self) -> String {
        self.messages
            .iter()
            .filter_map(Value::as_array)
            .find(|pair| pair.first().and_then(Value::as_str) == Some("execution_error"))
            .and_then(|pair| pair.get(1))
            .map(|data| {
                let node = data.get("node_id").and_then(Value::as_str).unwrap_or("?");
                let kind = data
                    .get("exception_type")
                    .and_then(Value::as_str)
                    .unwrap_or("error");
                let message = data
                    .get("exception_message")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim();
                format!("node {node} raised {kind}: {message}")
            })
            .unwrap_or_else(|| "server reported an execution error".to_string())
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] TransportError),

    /// The server returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A 2xx body that could not be decoded.
    #[error("Unexpected response body: {0}")]
    Decode(String),
}

impl ComfyUIApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ComfyUIApiError::ApiError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Longest response body kept in an error message.
const MAX_ERROR_BODY_CHARS: usize = 500;

impl ComfyUIApi {
    /// Create an API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(transport: Arc<dyn HttpTransport>, api_url: String) -> Self {
        Self {
            transport,
            api_url,
            request_timeout: None,
        }
    }

    /// Apply a timeout to every request made through this client.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Copy of this client whose request timeout is at most `limit`.
    pub fn capped(&self, limit: Duration) -> Self {
        let request_timeout = match self.request_timeout {
            Some(timeout) => timeout.min(limit),
            None => limit,
        };
        Self {
            transport: Arc::clone(&self.transport),
            api_url: self.api_url.clone(),
            request_timeout: Some(request_timeout),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends `POST /prompt` with the workflow and client ID. Returns the
    /// server-assigned `prompt_id` and queue position.
    pub async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });
        let request = HttpRequest::post_json(format!("{}/prompt", self.api_url), body);
        let response = self.send(request).await?;
        Self::parse_json(response)
    }

    /// Retrieve the history entry for one prompt.
    ///
    /// Sends `GET /history/{prompt_id}`. The server answers `{}` until the
    /// prompt has finished, which maps to `None`.
    pub async fn get_history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        let request = HttpRequest::get(format!("{}/history/{}", self.api_url, prompt_id));
        let response = self.send(request).await?;
        let mut entries: BTreeMap<String, HistoryEntry> = Self::parse_json(response)?;
        Ok(entries.remove(prompt_id))
    }

    /// Retrieve the most recent history entries (`GET /history?max_items=N`).
    pub async fn recent_history(
        &self,
        max_items: u32,
    ) -> Result<BTreeMap<String, HistoryEntry>, ComfyUIApiError> {
        let request = HttpRequest::get(format!("{}/history?max_items={max_items}", self.api_url));
        let response = self.send(request).await?;
        Self::parse_json(response)
    }

    /// Upload image bytes (`POST /upload/image`, multipart).
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        mime_type: &str,
        overwrite: bool,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let fields = vec![
            MultipartField::File {
                name: "image".into(),
                file_name: file_name.to_string(),
                mime_type: mime_type.to_string(),
                bytes,
            },
            MultipartField::Text {
                name: "overwrite".into(),
                value: overwrite.to_string(),
            },
            MultipartField::Text {
                name: "type".into(),
                value: "input".into(),
            },
        ];
        let request = HttpRequest::post_multipart(format!("{}/upload/image", self.api_url), fields);
        let response = self.send(request).await?;
        Self::parse_json(response)
    }

    /// Download artifact bytes for a server-relative `/view?...` path.
    pub async fn view(&self, path: &str) -> Result<Vec<u8>, ComfyUIApiError> {
        let request = HttpRequest::get(format!("{}{}", self.api_url, path));
        let response = self.send(request).await?;
        Ok(response.body)
    }

    /// Server/device information (`GET /system_stats`).
    pub async fn system_stats(&self) -> Result<Value, ComfyUIApiError> {
        let request = HttpRequest::get(format!("{}/system_stats", self.api_url));
        let response = self.send(request).await?;
        Self::parse_json(response)
    }

    /// Remove a queued prompt (`POST /queue` with `{"delete": [id]}`).
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({ "delete": [prompt_id] });
        let request = HttpRequest::post_json(format!("{}/queue", self.api_url), body);
        self.send(request).await?;
        Ok(())
    }

    /// Fetch an arbitrary absolute URL (external image downloads), reading
    /// at most `max_body_bytes` of the response.
    pub async fn fetch_url(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        max_body_bytes: usize,
    ) -> Result<HttpResponse, ComfyUIApiError> {
        let mut request = HttpRequest::get(url).with_max_body_bytes(max_body_bytes);
        for (name, value) in headers {
            request = request.with_header(*name, *value);
        }
        self.send(request).await
    }

    // ---- private helpers ----

    /// Send a request and ensure the response has a success status code.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ComfyUIApiError> {
        let request = request.with_timeout(self.request_timeout);
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            let mut body = response.text();
            if body.len() > MAX_ERROR_BODY_CHARS {
                let cut = (0..=MAX_ERROR_BODY_CHARS)
                    .rev()
                    .find(|i| body.is_char_boundary(*i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            return Err(ComfyUIApiError::ApiError {
                status: response.status,
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    fn parse_json<T: serde::de::DeserializeOwned>(response: HttpResponse) -> Result<T, ComfyUIApiError> {
        serde_json::from_slice(&response.body).map_err(|e| ComfyUIApiError::Decode(e.to_string()))
    }
}

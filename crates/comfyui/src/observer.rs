//! Execution lifecycle events and the observers that receive them.
//!
//! The client never logs through global state alone: every lifecycle step
//! is also delivered to an injected [`ExecutionObserver`]. Use
//! [`NoopObserver`] to disable, [`TracingObserver`] to log, or
//! [`BroadcastObserver`] to fan events out to async subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

/// Broadcast channel capacity for execution events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A lifecycle event of one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// The server accepted the workflow.
    Submitted { prompt_id: String, client_id: String },

    /// A retryable call failed and will be attempted again after `delay_ms`.
    Retrying {
        operation: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// One history poll is about to run.
    Polling { prompt_id: String, elapsed_ms: u64 },

    /// Step-level progress reported over the WebSocket.
    Progress {
        node: Option<String>,
        value: i64,
        max: i64,
        /// Completion percentage (0-100).
        percent: u8,
    },

    /// Server queue depth, broadcast to every client.
    QueueStatus { queue_remaining: i32 },

    /// Nodes whose outputs the server reused from cache.
    NodesCached { prompt_id: String, nodes: Vec<String> },

    /// The server started executing a node.
    NodeExecuting { prompt_id: String, node: String },

    /// A node finished; `output_keys` names what it produced (`images`, ...).
    NodeExecuted {
        prompt_id: String,
        node: String,
        output_keys: Vec<String>,
    },

    /// A node raised an error on the server.
    NodeError {
        prompt_id: String,
        node: String,
        exception_type: String,
        message: String,
    },

    /// Image bytes were uploaded for an image parameter.
    ImageUploaded { filename: String },

    Completed {
        prompt_id: String,
        image_count: usize,
        video_count: usize,
    },

    Failed {
        prompt_id: Option<String>,
        error: String,
    },

    TimedOut { prompt_id: String, elapsed_ms: u64 },

    Cancelled { prompt_id: Option<String> },
}

/// Receives execution events. Implementations must not block.
pub trait ExecutionObserver: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {
    fn on_event(&self, _event: &ExecutionEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::Submitted {
                prompt_id,
                client_id,
            } => tracing::info!(%prompt_id, %client_id, "Workflow submitted"),
            ExecutionEvent::Retrying {
                operation,
                attempt,
                delay_ms,
                error,
            } => tracing::warn!(%operation, attempt, delay_ms, %error, "Retrying"),
            ExecutionEvent::Polling {
                prompt_id,
                elapsed_ms,
            } => tracing::trace!(%prompt_id, elapsed_ms, "Polling history"),
            ExecutionEvent::Progress {
                node,
                value,
                max,
                percent,
            } => tracing::debug!(node = ?node, value, max, percent, "Generation progress"),
            ExecutionEvent::QueueStatus { queue_remaining } => {
                tracing::debug!(queue_remaining, "Queue status")
            }
            ExecutionEvent::NodesCached { prompt_id, nodes } => {
                tracing::debug!(%prompt_id, cached = nodes.len(), "Nodes served from cache")
            }
            ExecutionEvent::NodeExecuting { prompt_id, node } => {
                tracing::debug!(%prompt_id, %node, "Executing node")
            }
            ExecutionEvent::NodeExecuted {
                prompt_id,
                node,
                output_keys,
            } => tracing::debug!(%prompt_id, %node, outputs = ?output_keys, "Node executed"),
            ExecutionEvent::NodeError {
                prompt_id,
                node,
                exception_type,
                message,
            } => tracing::warn!(%prompt_id, %node, %exception_type, %message, "Node raised an error"),
            ExecutionEvent::ImageUploaded { filename } => {
                tracing::info!(%filename, "Image uploaded")
            }
            ExecutionEvent::Completed {
                prompt_id,
                image_count,
                video_count,
            } => tracing::info!(%prompt_id, image_count, video_count, "Execution completed"),
            ExecutionEvent::Failed { prompt_id, error } => {
                tracing::error!(prompt_id = ?prompt_id, %error, "Execution failed")
            }
            ExecutionEvent::TimedOut {
                prompt_id,
                elapsed_ms,
            } => tracing::warn!(%prompt_id, elapsed_ms, "Execution timed out"),
            ExecutionEvent::Cancelled { prompt_id } => {
                tracing::info!(prompt_id = ?prompt_id, "Execution cancelled")
            }
        }
    }
}

/// Fans events out over a [`broadcast`] channel.
pub struct BroadcastObserver {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastObserver {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl ExecutionObserver for BroadcastObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        // A send error only means nobody is subscribed.
        let _ = self.sender.send(event.clone());
    }
}

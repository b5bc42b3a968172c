//! Optional WebSocket progress stream for a running prompt.
//!
//! Polling history stays the source of truth for completion; this listener
//! only forwards step progress and node changes to the observer.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::messages::parse_message;
use crate::observer::ExecutionObserver;

/// Aborts the listener task when dropped.
pub struct ProgressGuard {
    task: JoinHandle<()>,
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Run [`listen`] on a background task tied to the returned guard.
pub fn spawn_progress_listener(
    ws_url: String,
    prompt_id: String,
    observer: Arc<dyn ExecutionObserver>,
    cancel: CancellationToken,
) -> ProgressGuard {
    let task = tokio::spawn(async move {
        listen(&ws_url, &prompt_id, observer.as_ref(), &cancel).await;
    });
    ProgressGuard { task }
}

/// Forward progress for `prompt_id` until it ends, the socket closes, or
/// `cancel` fires. Connection problems are logged, never surfaced.
pub async fn listen(
    ws_url: &str,
    prompt_id: &str,
    observer: &dyn ExecutionObserver,
    cancel: &CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connect_async(ws_url) => result,
    };
    let mut ws_stream = match connected {
        Ok((stream, _response)) => stream,
        Err(e) => {
            tracing::warn!(prompt_id, error = %e, "Progress stream unavailable");
            return;
        }
    };
    tracing::debug!(prompt_id, "Progress stream connected");

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = ws_stream.next() => next,
        };
        let Some(msg_result) = next else {
            break;
        };

        match msg_result {
            Ok(Message::Text(text)) => {
                if handle_text_message(&text, prompt_id, observer) {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::trace!(prompt_id, "Ignoring binary message (preview image)");
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Ok(Message::Close(frame)) => {
                tracing::debug!(prompt_id, ?frame, "Progress stream closed");
                break;
            }
            Err(e) => {
                tracing::warn!(prompt_id, error = %e, "Progress stream receive error");
                break;
            }
        }
    }

    let _ = ws_stream.close(None).await;
}

/// Forward one text frame. Returns `true` once the prompt has ended.
pub fn handle_text_message(text: &str, prompt_id: &str, observer: &dyn ExecutionObserver) -> bool {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::trace!(error = %e, "Skipping unrecognized WebSocket message");
            return false;
        }
    };

    if let Some(event) = msg.to_event(prompt_id) {
        observer.on_event(&event);
    }
    msg.ends(prompt_id)
}

//! One-shot execution client.
//!
//! An [`ExecutionClient`] owns a single submission: it applies overrides,
//! submits the graph, polls history until a terminal state, and is then
//! discarded. Cancellation and cleanup are shared through one
//! [`CancellationToken`]; dropping the client destroys it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use genrelay_core::artifacts::extract_outputs;
use genrelay_core::execution::{ExecutionHandle, ExecutionResult, ExecutionState, ExecutionStatus};
use genrelay_core::overrides::ParameterOverride;
use genrelay_core::workflow::WorkflowGraph;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::api::{ComfyUIApi, Completion};
use crate::clock::{Clock, TokioClock};
use crate::config::ExecutionConfig;
use crate::error::ComfyUIError;
use crate::images::ImageResolver;
use crate::mutator;
use crate::observer::{ExecutionEvent, ExecutionObserver, TracingObserver};
use crate::progress::{spawn_progress_listener, ProgressGuard};
use crate::retry::{Deadline, RetryConfig, RetryContext};
use crate::transport::HttpTransport;

pub struct ExecutionClient {
    api: ComfyUIApi,
    config: ExecutionConfig,
    server: Url,
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn ExecutionObserver>,
    cancel: CancellationToken,
    inner: Mutex<ClientState>,
}

struct ClientState {
    state: ExecutionState,
    handle: Option<ExecutionHandle>,
    destroyed: bool,
}

/// How a finished poll loop ended, before it is recorded.
enum Outcome {
    Completed(ExecutionResult),
    Failed(ExecutionResult),
    TimedOut(ExecutionResult),
    Cancelled,
}

impl ExecutionClient {
    pub fn new(config: ExecutionConfig, transport: Arc<dyn HttpTransport>) -> Result<Self, ComfyUIError> {
        let server = config.server_url()?;
        let api = ComfyUIApi::new(transport, config.base_url.clone()).with_request_timeout(config.timeout);
        Ok(Self {
            api,
            retry: config.retry_config(),
            server,
            config,
            clock: Arc::new(TokioClock::new()),
            observer: Arc::new(TracingObserver),
            cancel: CancellationToken::new(),
            inner: Mutex::new(ClientState {
                state: ExecutionState::Idle,
                handle: None,
                destroyed: false,
            }),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Use a caller-owned token, e.g. one cancelled on Ctrl-C.
    pub fn with_cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> ExecutionState {
        self.lock().state
    }

    /// Identifiers of the submitted prompt, once there is one.
    pub fn handle(&self) -> Option<ExecutionHandle> {
        self.lock().handle.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn retry_context(&self) -> RetryContext<'_> {
        RetryContext {
            config: &self.retry,
            clock: self.clock.as_ref(),
            cancel: &self.cancel,
            observer: self.observer.as_ref(),
            deadline: None,
        }
    }

    pub fn image_resolver(&self) -> ImageResolver<'_> {
        ImageResolver::new(
            &self.api,
            self.retry_context(),
            self.server.clone(),
            self.config.overwrite_uploads,
        )
    }

    /// Apply overrides to `graph`, uploading images where needed.
    pub async fn apply_overrides(
        &self,
        graph: &mut WorkflowGraph,
        overrides: &[ParameterOverride],
    ) -> Result<(), ComfyUIError> {
        self.ensure_usable()?;
        mutator::apply_overrides(graph, overrides, &self.image_resolver()).await
    }

    /// Submit `graph` and poll until it completes, fails, or times out.
    ///
    /// `config.timeout` bounds submission and polling together, including
    /// requests still in flight when it passes. Server-side failures and
    /// timeouts come back as an [`ExecutionResult`]; `Err` is reserved for
    /// cancellation and misuse of the client.
    pub async fn execute(&self, graph: &WorkflowGraph) -> Result<ExecutionResult, ComfyUIError> {
        self.ensure_usable()?;
        if self.lock().state != ExecutionState::Idle {
            return Err(ComfyUIError::Unusable(
                "an execution was already submitted with this client".into(),
            ));
        }

        let started = self.clock.now();
        let deadline = Deadline::new(started, self.config.timeout);
        for link in graph.dangling_links() {
            tracing::warn!(
                node = %link.to_node,
                input = %link.to_input,
                source = %link.from.node_id,
                "Input links to a node that is not in the workflow",
            );
        }

        let client_id = uuid::Uuid::new_v4().to_string();
        let workflow = graph.to_value();
        let retry = self.retry_context().with_deadline(deadline);
        let submitted = retry
            .run("Workflow submission", || {
                let api = self.bounded_api(&retry);
                let (workflow, client_id) = (&workflow, &client_id);
                async move { api.submit_workflow(workflow, client_id).await }
            })
            .await;

        let submit = match submitted {
            Ok(submit) => submit,
            Err(ComfyUIError::Cancelled) => return self.finish(Outcome::Cancelled, None).await,
            Err(ComfyUIError::Timeout { .. }) => {
                let result = ExecutionResult::timed_out(None, self.elapsed_ms(started));
                return self.finish(Outcome::TimedOut(result), None).await;
            }
            Err(err) => {
                let result = ExecutionResult::failed(None, err.to_string(), self.elapsed_ms(started));
                return self.finish(Outcome::Failed(result), None).await;
            }
        };

        let prompt_id = submit.prompt_id;
        if submit.node_errors.as_object().is_some_and(|errors| !errors.is_empty()) {
            tracing::warn!(%prompt_id, node_errors = %submit.node_errors, "Server reported node errors");
        }
        {
            let mut inner = self.lock();
            if inner.state == ExecutionState::Idle {
                inner.state = ExecutionState::Submitted;
            }
            inner.handle = Some(ExecutionHandle {
                prompt_id: prompt_id.clone(),
                client_id: client_id.clone(),
            });
        }
        self.observer.on_event(&ExecutionEvent::Submitted {
            prompt_id: prompt_id.clone(),
            client_id: client_id.clone(),
        });

        let _progress: Option<ProgressGuard> = self.config.stream_progress.then(|| {
            spawn_progress_listener(
                self.config.ws_url(&client_id),
                prompt_id.clone(),
                Arc::clone(&self.observer),
                self.cancel.child_token(),
            )
        });

        let outcome = self.poll_until_done(&prompt_id, deadline).await;
        self.finish(outcome, Some(&prompt_id)).await
    }

    /// Abort the execution. The client cannot be used afterwards.
    pub fn cancel(&self) {
        {
            let mut inner = self.lock();
            if !inner.state.is_terminal() {
                inner.state = ExecutionState::Cancelled;
            }
        }
        self.cancel.cancel();
    }

    /// Cancel in-flight work and mark the client unusable. Idempotent.
    pub fn destroy(&self) {
        {
            let mut inner = self.lock();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            if !inner.state.is_terminal() {
                inner.state = ExecutionState::Cancelled;
            }
        }
        self.cancel.cancel();
        tracing::debug!("Execution client destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    // ---- private helpers ----

    async fn poll_until_done(&self, prompt_id: &str, deadline: Deadline) -> Outcome {
        self.transition(ExecutionState::Polling);
        let started = deadline.started();
        let retry = self.retry_context().with_deadline(deadline);
        let timed_out = || {
            Outcome::TimedOut(ExecutionResult::timed_out(
                Some(prompt_id.to_string()),
                self.elapsed_ms(started),
            ))
        };

        loop {
            if self.cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            if deadline.remaining(self.clock.now()).is_zero() {
                return timed_out();
            }

            self.observer.on_event(&ExecutionEvent::Polling {
                prompt_id: prompt_id.to_string(),
                elapsed_ms: self.elapsed_ms(started),
            });
            let history = retry
                .run("History poll", || {
                    let api = self.bounded_api(&retry);
                    async move { api.get_history(prompt_id).await }
                })
                .await;

            match history {
                Ok(Some(entry)) => match entry.completion() {
                    Completion::Completed => {
                        let outputs = extract_outputs(&entry.outputs);
                        let result = ExecutionResult::completed(prompt_id, outputs, self.elapsed_ms(started));
                        return Outcome::Completed(result);
                    }
                    Completion::Errored(message) => {
                        let result = ExecutionResult::failed(
                            Some(prompt_id.to_string()),
                            message,
                            self.elapsed_ms(started),
                        );
                        return Outcome::Failed(result);
                    }
                    Completion::Pending => {}
                },
                Ok(None) => {}
                Err(ComfyUIError::Cancelled) => return Outcome::Cancelled,
                Err(ComfyUIError::Timeout { .. }) => return timed_out(),
                Err(err) => {
                    let result = ExecutionResult::failed(
                        Some(prompt_id.to_string()),
                        err.to_string(),
                        self.elapsed_ms(started),
                    );
                    return Outcome::Failed(result);
                }
            }

            let remaining = deadline.remaining(self.clock.now());
            if remaining.is_zero() {
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Outcome::Cancelled,
                _ = self.clock.sleep(self.config.poll_interval.min(remaining)) => {}
            }
        }
    }

    /// Record the terminal state. A cancellation that landed first wins.
    async fn finish(
        &self,
        outcome: Outcome,
        prompt_id: Option<&str>,
    ) -> Result<ExecutionResult, ComfyUIError> {
        let (state, result) = match outcome {
            Outcome::Completed(r) => (ExecutionState::Completed, Some(r)),
            Outcome::Failed(r) => (ExecutionState::Failed, Some(r)),
            Outcome::TimedOut(r) => (ExecutionState::TimedOut, Some(r)),
            Outcome::Cancelled => (ExecutionState::Cancelled, None),
        };

        let recorded = self.transition(state);
        let result = match result {
            Some(result) if recorded && !self.cancel.is_cancelled() => result,
            _ => {
                self.transition(ExecutionState::Cancelled);
                self.abandon(prompt_id).await;
                return Err(ComfyUIError::Cancelled);
            }
        };

        let event = match result.status {
            ExecutionStatus::Completed => ExecutionEvent::Completed {
                prompt_id: result.prompt_id.clone().unwrap_or_default(),
                image_count: result.images.len(),
                video_count: result.videos.len(),
            },
            ExecutionStatus::Failed => ExecutionEvent::Failed {
                prompt_id: result.prompt_id.clone(),
                error: result.error.clone().unwrap_or_default(),
            },
            ExecutionStatus::TimedOut => ExecutionEvent::TimedOut {
                prompt_id: result.prompt_id.clone().unwrap_or_default(),
                elapsed_ms: result.elapsed_ms,
            },
        };
        self.observer.on_event(&event);
        Ok(result)
    }

    /// Best-effort removal of a queued prompt after cancellation.
    async fn abandon(&self, prompt_id: Option<&str>) {
        self.observer.on_event(&ExecutionEvent::Cancelled {
            prompt_id: prompt_id.map(str::to_string),
        });
        let Some(prompt_id) = prompt_id else {
            return;
        };
        if let Err(e) = self.api.cancel_execution(prompt_id).await {
            tracing::debug!(%prompt_id, error = %e, "Could not remove cancelled prompt from queue");
        }
    }

    /// API handle whose request timeout does not outlast the deadline.
    fn bounded_api(&self, retry: &RetryContext<'_>) -> ComfyUIApi {
        match retry.remaining() {
            Some(remaining) => self.api.capped(remaining),
            None => self.api.clone(),
        }
    }

    /// Move to `next` unless a terminal state was already reached.
    fn transition(&self, next: ExecutionState) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return inner.state == next;
        }
        inner.state = next;
        true
    }

    fn ensure_usable(&self) -> Result<(), ComfyUIError> {
        let inner = self.lock();
        if inner.destroyed {
            return Err(ComfyUIError::Unusable("client has been destroyed".into()));
        }
        if inner.state == ExecutionState::Cancelled || self.cancel.is_cancelled() {
            return Err(ComfyUIError::Unusable("client has been cancelled".into()));
        }
        Ok(())
    }

    fn elapsed_ms(&self, started: Duration) -> u64 {
        self.clock.now().saturating_sub(started).as_millis() as u64
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ExecutionClient {
    fn drop(&mut self) {
        self.destroy();
    }
}

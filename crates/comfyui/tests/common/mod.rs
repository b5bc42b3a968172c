#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use genrelay_comfyui::clock::ManualClock;
use genrelay_comfyui::config::ExecutionConfig;
use genrelay_comfyui::observer::{ExecutionEvent, ExecutionObserver};
use genrelay_comfyui::transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, TransportError};
use genrelay_comfyui::ExecutionClient;

pub const SERVER: &str = "http://127.0.0.1:8188";

/// Smallest byte sequence `image::guess_format` recognizes as PNG.
pub const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 1, 2, 3, 4];

/// A scripted reply.
#[derive(Clone)]
pub enum Reply {
    Response(HttpResponse),
    Error(TransportError),
}

pub fn json_reply(status: u16, body: Value) -> Reply {
    Reply::Response(HttpResponse {
        status,
        headers: vec![("content-type".into(), "application/json".into())],
        body: serde_json::to_vec(&body).unwrap(),
    })
}

pub fn bytes_reply(status: u16, body: &[u8]) -> Reply {
    Reply::Response(HttpResponse {
        status,
        headers: Vec::new(),
        body: body.to_vec(),
    })
}

struct Route {
    method: HttpMethod,
    url_fragment: String,
    replies: VecDeque<Reply>,
}

/// [`HttpTransport`] that answers from scripted routes and records every
/// request. Each route's replies are used in order; the last one repeats.
/// Unmatched requests get a 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, method: HttpMethod, url_fragment: &str, replies: Vec<Reply>) {
        self.routes.lock().unwrap().push(Route {
            method,
            url_fragment: url_fragment.to_string(),
            replies: replies.into(),
        });
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Recorded requests whose URL contains `fragment`.
    pub fn requests_to(&self, method: HttpMethod, fragment: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.url.contains(fragment))
            .collect()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());

        let reply = {
            let mut routes = self.routes.lock().unwrap();
            routes
                .iter_mut()
                .find(|route| route.method == request.method && request.url.contains(&route.url_fragment))
                .and_then(|route| {
                    if route.replies.len() > 1 {
                        route.replies.pop_front()
                    } else {
                        route.replies.front().cloned()
                    }
                })
        };

        match reply {
            Some(Reply::Response(response)) => match request.max_body_bytes {
                Some(limit) if response.body.len() > limit => Err(TransportError::BodyTooLarge { limit }),
                _ => Ok(response),
            },
            Some(Reply::Error(err)) => Err(err),
            None => Ok(HttpResponse {
                status: 404,
                headers: Vec::new(),
                body: b"no route".to_vec(),
            }),
        }
    }
}

/// [`HttpTransport`] that never answers requests whose URL contains
/// `stall_on`. Submissions get prompt `p-1`; anything else gets `{}`.
pub struct StalledTransport {
    stall_on: String,
    requests: Mutex<Vec<HttpRequest>>,
    stalled: tokio::sync::Notify,
}

impl StalledTransport {
    pub fn new(stall_on: &str) -> Arc<Self> {
        Arc::new(Self {
            stall_on: stall_on.to_string(),
            requests: Mutex::new(Vec::new()),
            stalled: tokio::sync::Notify::new(),
        })
    }

    /// Resolves once a request has hung.
    pub async fn wait_until_stalled(&self) {
        self.stalled.notified().await;
    }

    pub fn requests_to(&self, method: HttpMethod, fragment: &str) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && r.url.contains(fragment))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HttpTransport for StalledTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());

        if request.url.contains(&self.stall_on) {
            self.stalled.notify_one();
            return std::future::pending().await;
        }
        let body = if request.url.ends_with("/prompt") {
            serde_json::json!({ "prompt_id": "p-1", "number": 1, "node_errors": {} })
        } else {
            serde_json::json!({})
        };
        Ok(HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: serde_json::to_vec(&body).unwrap(),
        })
    }
}

/// Observer that keeps every event.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ExecutionObserver for RecordingObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Config with short, deterministic timings.
pub fn test_config() -> ExecutionConfig {
    ExecutionConfig::new(SERVER)
        .unwrap()
        .with_timeout(Duration::from_secs(10))
        .with_max_retries(3)
        .with_retry_base_delay(Duration::from_millis(100))
        .with_poll_interval(Duration::from_secs(1))
}

/// Client wired to the mock transport and a virtual clock.
pub fn test_client(
    config: ExecutionConfig,
    transport: &Arc<MockTransport>,
) -> (ExecutionClient, Arc<ManualClock>, Arc<RecordingObserver>) {
    let clock = Arc::new(ManualClock::new());
    let observer = Arc::new(RecordingObserver::default());
    let client = ExecutionClient::new(config, transport.clone())
        .unwrap()
        .with_clock(clock.clone())
        .with_observer(observer.clone());
    (client, clock, observer)
}

pub fn submit_reply(prompt_id: &str) -> Reply {
    json_reply(
        200,
        serde_json::json!({ "prompt_id": prompt_id, "number": 1, "node_errors": {} }),
    )
}

pub fn completed_history(prompt_id: &str, outputs: Value) -> Reply {
    history_reply(
        prompt_id,
        serde_json::json!({
            "outputs": outputs,
            "status": { "status_str": "success", "completed": true, "messages": [] }
        }),
    )
}

/// `/history/{id}` body holding one entry.
pub fn history_reply(prompt_id: &str, entry: Value) -> Reply {
    let mut body = serde_json::Map::new();
    body.insert(prompt_id.to_string(), entry);
    json_reply(200, Value::Object(body))
}

pub fn pending_history() -> Reply {
    json_reply(200, serde_json::json!({}))
}

/// Two-node text-to-image style workflow.
pub fn sample_workflow() -> Value {
    serde_json::json!({
        "3": {
            "class_type": "KSampler",
            "inputs": { "seed": 1, "steps": 20, "model": ["4", 0] }
        },
        "4": {
            "class_type": "CheckpointLoaderSimple",
            "inputs": { "ckpt_name": "sd15.safetensors" }
        },
        "10": {
            "class_type": "LoadImage",
            "inputs": { "image": "placeholder.png" }
        }
    })
}

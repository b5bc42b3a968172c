//! End-to-end tests for `run_workflow` against a scripted server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use genrelay_comfyui::observer::NoopObserver;
use genrelay_comfyui::pipeline::{run_workflow, WorkflowRequest};
use genrelay_comfyui::transport::{HttpMethod, RequestBody};
use genrelay_comfyui::ComfyUIError;
use genrelay_core::codec::decode_base64;
use genrelay_core::overrides::OverrideRecord;

use common::*;

const MP4_BYTES: &[u8] = b"\x00\x00\x00\x18ftypmp42";

fn request() -> WorkflowRequest {
    WorkflowRequest::new(sample_workflow().to_string())
}

fn seed_override(seed: u64) -> OverrideRecord {
    serde_json::from_value(json!({
        "nodeId": "3",
        "paramName": "seed",
        "type": "number",
        "value": seed
    }))
    .unwrap()
}

// ---------------------------------------------------------------------------
// Test: a full run applies overrides and keys every artifact
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_run_returns_keyed_outputs() {
    let transport = MockTransport::new();
    transport.on(HttpMethod::Post, "/prompt", vec![submit_reply("p-9")]);
    transport.on(
        HttpMethod::Get,
        "/history/p-9",
        vec![completed_history(
            "p-9",
            json!({
                "9": { "images": [
                    { "filename": "a.png", "subfolder": "", "type": "output" },
                    { "filename": "b.png", "subfolder": "", "type": "output" }
                ] },
                "11": { "gifs": [{ "filename": "clip.mp4", "subfolder": "", "type": "output" }] }
            }),
        )],
    );
    transport.on(HttpMethod::Get, "filename=clip.mp4", vec![bytes_reply(200, MP4_BYTES)]);
    transport.on(HttpMethod::Get, "/view", vec![bytes_reply(200, PNG_BYTES)]);

    let mut request = request();
    request.overrides = vec![seed_override(1234)];
    request.primary_key = "result".into();

    let run = run_workflow(
        test_config(),
        transport.clone(),
        request,
        Arc::new(NoopObserver),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let keys: Vec<&str> = run.outputs.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["image_1", "result", "video_0"]);
    assert_eq!(run.outputs["result"].file_name, "a.png");
    assert_eq!(run.outputs["result"].mime_type, "image/png");
    assert_eq!(decode_base64(&run.outputs["result"].data).unwrap(), PNG_BYTES);
    assert_eq!(run.outputs["video_0"].mime_type, "video/mp4");

    assert_eq!(run.summary["image_count"], 2);
    assert_eq!(run.summary["video_count"], 1);
    assert_eq!(
        run.summary["videos"][0],
        "http://127.0.0.1:8188/view?filename=clip.mp4&subfolder=&type=output"
    );

    let submit = &transport.requests_to(HttpMethod::Post, "/prompt")[0];
    let RequestBody::Json(body) = &submit.body else {
        panic!("expected JSON body");
    };
    assert_eq!(body["prompt"]["3"]["inputs"]["seed"], json!(1234));
}

// ---------------------------------------------------------------------------
// Test: invalid workflow JSON is rejected before any request
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_workflow_is_rejected_locally() {
    let transport = MockTransport::new();

    let err = run_workflow(
        test_config(),
        transport.clone(),
        WorkflowRequest::new(r#"{"3": {"inputs": {}}}"#),
        Arc::new(NoopObserver),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(
        err,
        ComfyUIError::Validation("Node '3' is missing required 'class_type' field".into())
    );
    assert!(transport.requests().is_empty());
}

// ---------------------------------------------------------------------------
// Test: an override naming a missing node stops the run before submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn override_on_missing_node_stops_run() {
    let transport = MockTransport::new();
    let mut request = request();
    request.overrides = vec![serde_json::from_value(json!({
        "nodeId": "77",
        "paramName": "text",
        "type": "text",
        "value": "hello"
    }))
    .unwrap()];

    let err = run_workflow(
        test_config(),
        transport.clone(),
        request,
        Arc::new(NoopObserver),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_matches!(err, ComfyUIError::Validation(ref m) if m.starts_with("override #1: "));
    assert!(transport.requests_to(HttpMethod::Post, "/prompt").is_empty());
}

// ---------------------------------------------------------------------------
// Test: server-side failure surfaces as an Execution error
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_result_becomes_execution_error() {
    let transport = MockTransport::new();
    transport.on(HttpMethod::Post, "/prompt", vec![submit_reply("p-1")]);
    transport.on(
        HttpMethod::Get,
        "/history/p-1",
        vec![history_reply("p-1", json!({ "status": { "status_str": "error" } }))],
    );

    let err = run_workflow(
        test_config(),
        transport,
        request(),
        Arc::new(NoopObserver),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(
        err,
        ComfyUIError::Execution("server reported an execution error".into())
    );
}

// ---------------------------------------------------------------------------
// Test: a timed-out result surfaces as a Timeout error
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn timed_out_result_becomes_timeout_error() {
    let transport = MockTransport::new();
    transport.on(HttpMethod::Post, "/prompt", vec![submit_reply("p-1")]);
    transport.on(HttpMethod::Get, "/history/p-1", vec![pending_history()]);
    let config = test_config().with_timeout(Duration::from_secs(3));

    let err = run_workflow(
        config,
        transport,
        request(),
        Arc::new(NoopObserver),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_matches!(err, ComfyUIError::Timeout { elapsed } if elapsed >= Duration::from_secs(3));
}

// ---------------------------------------------------------------------------
// Test: the caller's token survives the run's cleanup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn caller_token_is_not_cancelled_by_cleanup() {
    let transport = MockTransport::new();
    transport.on(HttpMethod::Post, "/prompt", vec![submit_reply("p-1")]);
    transport.on(HttpMethod::Get, "/history/p-1", vec![completed_history("p-1", json!({}))]);
    let cancel = CancellationToken::new();

    let run = run_workflow(test_config(), transport, request(), Arc::new(NoopObserver), &cancel)
        .await
        .unwrap();

    assert!(run.outputs.is_empty());
    assert!(!cancel.is_cancelled());
}

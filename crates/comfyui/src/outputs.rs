//! Mapping finished executions onto caller-facing outputs.

use std::collections::BTreeMap;

use futures::future::try_join_all;
use genrelay_core::artifacts::{assign_output_keys, Artifact, OutputSlot};
use genrelay_core::codec::encode_base64;
use genrelay_core::execution::ExecutionResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::client::ExecutionClient;
use crate::config::ExecutionConfig;
use crate::error::ComfyUIError;

/// One downloaded artifact, base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryOutput {
    pub data: String,
    pub mime_type: String,
    pub file_name: String,
}

/// Download every artifact of `result` concurrently and key it by the
/// output key policy. Any failed or empty download fails the whole call.
pub async fn fetch_outputs(
    client: &ExecutionClient,
    result: &ExecutionResult,
    primary_key: &str,
) -> Result<BTreeMap<String, BinaryOutput>, ComfyUIError> {
    let slots = assign_output_keys(&result.images, &result.videos, primary_key);
    let downloads = slots.iter().map(|slot| fetch_slot(client, slot));
    let outputs = try_join_all(downloads).await?;
    Ok(outputs.into_iter().collect())
}

async fn fetch_slot(client: &ExecutionClient, slot: &OutputSlot) -> Result<(String, BinaryOutput), ComfyUIError> {
    let artifact = Artifact::from_path(&slot.path, slot.kind)?;
    let bytes = client
        .retry_context()
        .run("Artifact download", || client.api().view(&slot.path))
        .await?;
    if bytes.is_empty() {
        return Err(ComfyUIError::Data(format!(
            "Artifact '{}' downloaded as zero bytes",
            artifact.filename
        )));
    }

    tracing::debug!(key = %slot.key, file = %artifact.filename, size = bytes.len(), "Fetched artifact");
    Ok((
        slot.key.clone(),
        BinaryOutput {
            data: encode_base64(&bytes),
            mime_type: artifact.mime_type,
            file_name: artifact.filename,
        },
    ))
}

/// JSON summary of a result, with artifact paths made absolute.
pub fn summarize(result: &ExecutionResult, config: &ExecutionConfig) -> Value {
    let absolute = |paths: &[String]| -> Vec<String> { paths.iter().map(|p| config.absolute_url(p)).collect() };

    let mut summary = json!({
        "success": result.success,
        "status": result.status,
        "prompt_id": result.prompt_id,
        "image_count": result.images.len(),
        "video_count": result.videos.len(),
        "images": absolute(&result.images),
        "videos": absolute(&result.videos),
        "raw_output": result.raw_output.clone().unwrap_or_else(|| json!({})),
        "elapsed_ms": result.elapsed_ms,
    });
    if let (Some(error), Some(map)) = (&result.error, summary.as_object_mut()) {
        map.insert("error".into(), Value::String(error.clone()));
    }
    summary
}

#[cfg(test)]
mod tests {
    use genrelay_core::artifacts::{view_path, ExtractedOutputs};

    use super::*;

    #[test]
    fn summary_uses_absolute_urls() {
        let config = ExecutionConfig::new("http://gpu:8188").unwrap();
        let outputs = ExtractedOutputs {
            images: vec![view_path("a.png", "", "output")],
            ..Default::default()
        };
        let result = ExecutionResult::completed("p1", outputs, 1500);

        let summary = summarize(&result, &config);

        assert_eq!(summary["success"], true);
        assert_eq!(summary["status"], "completed");
        assert_eq!(summary["image_count"], 1);
        assert_eq!(
            summary["images"][0],
            "http://gpu:8188/view?filename=a.png&subfolder=&type=output"
        );
        assert_eq!(summary["raw_output"], json!({}));
        assert!(summary.get("error").is_none());
    }

    #[test]
    fn summary_includes_error() {
        let config = ExecutionConfig::new("http://gpu:8188").unwrap();
        let result = ExecutionResult::failed(None, "boom", 3);
        let summary = summarize(&result, &config);
        assert_eq!(summary["error"], "boom");
        assert_eq!(summary["prompt_id"], Value::Null);
        assert_eq!(summary["status"], "failed");
    }
}

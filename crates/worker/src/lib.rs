//! Command-line front end for running one workflow against a ComfyUI server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use genrelay_comfyui::config::{normalize_base_url, ExecutionConfig};
use genrelay_comfyui::outputs::BinaryOutput;
use genrelay_comfyui::pipeline::WorkflowRequest;
use genrelay_core::codec::decode_base64;
use genrelay_core::overrides::{BinaryStore, OverrideRecord, DEFAULT_BINARY_PROPERTY};

/// genrelay - submit a ComfyUI workflow, wait for it, and collect its outputs
#[derive(Debug, Parser)]
#[command(name = "genrelay-worker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the workflow graph (API-format JSON)
    #[arg(long, required_unless_present_any = ["system_info", "recent_history"])]
    pub workflow: Option<PathBuf>,

    /// JSON array of parameter overrides
    #[arg(long)]
    pub overrides: Option<PathBuf>,

    /// JSON object of binary attachments keyed by property name
    #[arg(long)]
    pub binaries: Option<PathBuf>,

    /// Directory to write downloaded artifacts into
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Output key for the first artifact
    #[arg(long, default_value = DEFAULT_BINARY_PROPERTY)]
    pub primary_key: String,

    /// Server URL (overrides COMFYUI_URL)
    #[arg(long)]
    pub url: Option<String>,

    /// Execution timeout in seconds (overrides COMFYUI_TIMEOUT_SECS)
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Print the server's system stats and exit
    #[arg(long)]
    pub system_info: bool,

    /// Print the N most recent history entries and exit
    #[arg(long, value_name = "N")]
    pub recent_history: Option<u32>,
}

impl Cli {
    /// Environment config with command-line overrides applied.
    pub fn execution_config(&self) -> Result<ExecutionConfig> {
        let mut config = ExecutionConfig::from_env().context("Failed to load configuration")?;
        if let Some(url) = &self.url {
            config.base_url = normalize_base_url(url)?;
        }
        if let Some(secs) = self.timeout_secs {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }

    /// Read the workflow and its overrides from disk.
    pub fn load_request(&self) -> Result<WorkflowRequest> {
        let path = self
            .workflow
            .as_deref()
            .context("--workflow is required to run a workflow")?;
        let workflow_json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow {}", path.display()))?;

        let mut request = WorkflowRequest::new(workflow_json);
        request.primary_key = self.primary_key.clone();
        if let Some(path) = &self.overrides {
            request.overrides = read_json::<Vec<OverrideRecord>>(path)?;
        }
        if let Some(path) = &self.binaries {
            request.binaries = read_json::<BinaryStore>(path)?;
        }
        Ok(request)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Decode each output and write it as `<key>_<file name>` under `dir`.
pub fn write_outputs<'a>(
    dir: &Path,
    outputs: impl IntoIterator<Item = (&'a String, &'a BinaryOutput)>,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut written = Vec::new();
    for (key, output) in outputs {
        let bytes = decode_base64(&output.data).with_context(|| format!("Output '{key}' is not valid base64"))?;
        let file_name = Path::new(&output.file_name)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| output.file_name.clone());
        let path = dir.join(format!("{key}_{file_name}"));
        std::fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(key = %key, path = %path.display(), "Wrote output");
        written.push(path);
    }
    Ok(written)
}

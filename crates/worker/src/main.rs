use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genrelay_comfyui::api::ComfyUIApi;
use genrelay_comfyui::observer::TracingObserver;
use genrelay_comfyui::pipeline::run_workflow;
use genrelay_comfyui::transport::{HttpTransport, ReqwestTransport};
use genrelay_worker::{write_outputs, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "genrelay_worker=info,genrelay_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.execution_config()?;
    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new());

    if cli.system_info || cli.recent_history.is_some() {
        let api = ComfyUIApi::new(transport, config.base_url.clone()).with_request_timeout(config.timeout);
        let report = match cli.recent_history {
            Some(max_items) => serde_json::to_value(
                api.recent_history(max_items)
                    .await?
                    .into_iter()
                    .map(|(id, entry)| (id, entry.outputs))
                    .collect::<serde_json::Map<_, _>>(),
            )?,
            None => api.system_stats().await?,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let request = cli.load_request()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    tracing::info!(url = %config.base_url, "Running workflow");
    let run = run_workflow(config, transport, request, Arc::new(TracingObserver), &cancel)
        .await
        .context("Workflow run failed")?;

    if let Some(dir) = &cli.output_dir {
        write_outputs(dir, &run.outputs)?;
    }
    println!("{}", serde_json::to_string_pretty(&run.summary)?);
    Ok(())
}

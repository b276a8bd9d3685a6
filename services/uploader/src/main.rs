use anyhow::{bail, Context, Result};
use rfq_uploader::{upload_paths, HttpTransport, PresignClient, UploadOrchestrator, UploaderConfig};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = UploaderConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.log_level);

    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        bail!("usage: rfq-uploader <file>...");
    }

    info!(files = paths.len(), endpoint = %config.endpoint, "Starting upload");

    let client = PresignClient::new(config.endpoint.clone(), config.request_timeout())
        .context("Failed to build presign client")?;
    let transport =
        HttpTransport::new(config.request_timeout()).context("Failed to build HTTP transport")?;
    let orchestrator = UploadOrchestrator::new(transport, config.retry_policy());

    let result = upload_paths(&client, &orchestrator, &paths, |index, percent| {
        info!(path = %paths[index].display(), percent = percent, "Upload progress");
    })
    .await;

    match result {
        Ok(keys) => {
            println!("{}", serde_json::to_string_pretty(&keys)?);
            Ok(())
        }
        Err(e) => {
            let orphaned = e.orphaned_keys();
            if !orphaned.is_empty() {
                error!(keys = ?orphaned, "Files uploaded before the failure were left in storage");
            }
            Err(e.into())
        }
    }
}

/// Initialize tracing/logging. Logs go to stderr so stdout carries only the keys.
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();
}

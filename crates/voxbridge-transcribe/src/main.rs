//! Transcription service binary.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use voxbridge_transcribe::{HttpTranscriber, LogSink, TranscribeConfig, TranscribeServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = TranscribeConfig::from_env();
    tracing::info!(
        host = %config.ws_host,
        port = config.ws_port,
        stt = %config.stt.model,
        "Starting transcription service"
    );

    let transcriber = Arc::new(HttpTranscriber::new(config.stt.clone()));
    let sink = Arc::new(LogSink);

    let server = TranscribeServer::new(config, transcriber, sink);
    let serve = tokio::spawn(server.run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    serve.abort();

    Ok(())
}

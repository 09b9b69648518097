//! Media server binary.
//!
//! The SIP/RTP stack is an external collaborator that drives the
//! [`voxbridge_media::MediaServer`] handle: it calls `start_call` /
//! `end_call` around call setup, `on_rtp_frame` from its capture
//! callback, and pulls playback frames on its outbound tick. This
//! binary wires configuration, the ASP destinations and the event
//! loops, then waits for shutdown.

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use voxbridge_media::{MediaConfig, MediaServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; the environment always wins.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = MediaConfig::from_env();
    tracing::info!(
        agent = %config.agent_url,
        transcribe = ?config.transcribe_url,
        sample_rate = config.audio.sample_rate,
        "Starting media server"
    );

    let (server, mut agent_events, transcribe_events) = MediaServer::new(config);
    server.connect_ami().await;

    // Drive agent events (response audio, call actions, connectivity).
    let event_server = server.clone();
    let agent_task = tokio::spawn(async move {
        while let Some(event) = agent_events.recv().await {
            event_server.handle_agent_event(event).await;
        }
    });

    // The transcription side only produces connectivity noise; drain it
    // so the channel never fills.
    let transcribe_task = transcribe_events.map(|mut events| {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                tracing::debug!(?event, "Transcribe event");
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    server.shutdown().await;
    agent_task.abort();
    if let Some(task) = transcribe_task {
        task.abort();
    }

    Ok(())
}

//! Conversational agent binary.

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use voxbridge_agent::config::AgentConfig;
use voxbridge_agent::providers::{
    create_llm_provider, create_stt_provider, create_tts_provider, ProviderPool,
};
use voxbridge_agent::server::AgentServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::from_env();
    tracing::info!(
        host = %config.ws_host,
        port = config.ws_port,
        stt = %config.stt.model,
        llm = %config.llm.model,
        tts = %config.tts.voice,
        "Starting agent"
    );

    // Shared providers go up before any traffic is accepted. The STT
    // model is the accelerator-hungry one; it gets the CPU fallback.
    let stt_config = voxbridge_agent::providers::ProviderConfig {
        device_fallback: voxbridge_agent::providers::DeviceFallback::GpuToCpu,
        ..config.provider.clone()
    };
    let stt = create_stt_provider(&config.stt, stt_config).context("creating STT provider")?;
    let llm = create_llm_provider(&config.llm, config.provider.clone())
        .context("creating LLM provider")?;
    let tts = create_tts_provider(&config.tts, config.provider.clone())
        .context("creating TTS provider")?;

    let pool = ProviderPool::new(stt, llm, tts);
    pool.initialize().await.context("initializing providers")?;

    let server = AgentServer::new(config, pool.clone());
    let serve = tokio::spawn(server.run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    serve.abort();
    pool.shutdown().await;

    Ok(())
}

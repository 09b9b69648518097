//! External-model providers.
//!
//! STT, LLM and TTS are opaque callables behind these contracts. Every
//! provider embeds a [`ProviderCore`] (lifecycle, retry, circuit
//! breaker, metrics); the shipped implementations speak to
//! OpenAI-compatible HTTP endpoints, and the factory maps a configured
//! provider name onto a concrete variant.

pub mod base;
pub mod llm;
pub mod pool;
pub mod stt;
pub mod tts;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

pub use base::{
    CircuitBreaker, CircuitState, DeviceFallback, HealthCheck, HealthStatus, ProviderConfig,
    ProviderCore, ProviderError, ProviderMetrics,
};
pub use llm::{HttpLlmProvider, LlmProvider, LlmSettings};
pub use pool::ProviderPool;
pub use stt::{HttpSttProvider, SttProvider, SttSettings};
pub use tts::{HttpTtsProvider, TtsProvider, TtsSettings};

/// Lifecycle shared by every provider kind.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The embedded base (metrics, breaker, connection flag).
    fn core(&self) -> &ProviderCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    /// Establish the provider's connection. The default just flips the
    /// flag; HTTP providers verify reachability instead.
    async fn connect(&self) -> Result<(), ProviderError> {
        self.core().set_connected(true);
        Ok(())
    }

    async fn disconnect(&self) {
        self.core().set_connected(false);
    }

    async fn health_check(&self) -> HealthCheck;

    /// Eliminate cold-start latency; returns warmup time in ms.
    async fn warmup(&self) -> Result<f64, ProviderError> {
        let start = Instant::now();
        let check = self.health_check().await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;
        if check.status == HealthStatus::Unhealthy {
            return Err(ProviderError::NotConnected);
        }
        Ok(elapsed_ms)
    }

    fn metrics(&self) -> ProviderMetrics {
        self.core().metrics()
    }

    fn circuit_state(&self) -> CircuitState {
        self.core().breaker().state()
    }
}

/// Map a configured STT provider name onto a concrete variant.
pub fn create_stt_provider(
    settings: &SttSettings,
    config: ProviderConfig,
) -> Result<Arc<dyn SttProvider>, ProviderError> {
    match settings.provider.as_str() {
        "http" | "openai" => Ok(Arc::new(HttpSttProvider::new(settings.clone(), config))),
        other => Err(ProviderError::Decode(format!(
            "unknown STT provider: {other}"
        ))),
    }
}

/// Map a configured LLM provider name onto a concrete variant.
pub fn create_llm_provider(
    settings: &LlmSettings,
    config: ProviderConfig,
) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    match settings.provider.as_str() {
        "http" | "openai" => Ok(Arc::new(HttpLlmProvider::new(settings.clone(), config))),
        other => Err(ProviderError::Decode(format!(
            "unknown LLM provider: {other}"
        ))),
    }
}

/// Map a configured TTS provider name onto a concrete variant.
pub fn create_tts_provider(
    settings: &TtsSettings,
    config: ProviderConfig,
) -> Result<Arc<dyn TtsProvider>, ProviderError> {
    match settings.provider.as_str() {
        "http" | "openai" => Ok(Arc::new(HttpTtsProvider::new(settings.clone(), config))),
        other => Err(ProviderError::Decode(format!(
            "unknown TTS provider: {other}"
        ))),
    }
}

//! Process-wide provider pool.
//!
//! One shared instance per provider kind, initialised before the
//! server accepts traffic and torn down at shutdown. Sessions hold the
//! pool by `Arc`; provider internals stay safe under sharing because
//! every call goes through the circuit breaker and their own clients.

use std::sync::Arc;

use super::llm::LlmProvider;
use super::stt::SttProvider;
use super::tts::TtsProvider;
use super::{Provider, ProviderError};

/// The shared STT/LLM/TTS triple.
pub struct ProviderPool {
    pub stt: Arc<dyn SttProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
}

impl ProviderPool {
    #[must_use]
    pub fn new(
        stt: Arc<dyn SttProvider>,
        llm: Arc<dyn LlmProvider>,
        tts: Arc<dyn TtsProvider>,
    ) -> Arc<Self> {
        Arc::new(Self { stt, llm, tts })
    }

    /// Connect and warm every provider.
    ///
    /// A provider that fails to warm is left connected but cold — its
    /// circuit breaker will handle the first real failures. Only a
    /// connect failure is fatal here.
    pub async fn initialize(&self) -> Result<(), ProviderError> {
        self.stt.connect().await?;
        self.llm.connect().await?;
        self.tts.connect().await?;

        for (kind, warmup) in [
            ("stt", self.stt.warmup().await),
            ("llm", self.llm.warmup().await),
            ("tts", self.tts.warmup().await),
        ] {
            match warmup {
                Ok(ms) => {
                    tracing::info!(provider = kind, warmup_ms = format_args!("{ms:.0}"), "Provider warm");
                }
                Err(e) => {
                    tracing::warn!(provider = kind, error = %e, "Provider warmup failed");
                }
            }
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.stt.disconnect().await;
        self.llm.disconnect().await;
        self.tts.disconnect().await;
        tracing::info!("Provider pool shut down");
    }
}

//! Speech-to-text provider.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use super::base::{HealthCheck, ProviderConfig, ProviderCore, ProviderError};
use super::Provider;

/// STT endpoint settings.
#[derive(Debug, Clone)]
pub struct SttSettings {
    /// Factory key ("http").
    pub provider: String,

    /// Base URL of the transcription endpoint.
    pub url: String,

    pub model: String,
    pub language: String,
    pub api_key: Option<String>,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            provider: "http".to_string(),
            url: "http://127.0.0.1:9000".to_string(),
            model: "whisper-1".to_string(),
            language: "en".to_string(),
            api_key: None,
        }
    }
}

/// Transcription contract.
#[async_trait]
pub trait SttProvider: Provider {
    /// Transcribe one utterance of PCM.
    ///
    /// Returns `None` when the model heard no speech — that is not an
    /// error and must not consume a conversation turn.
    async fn transcribe(
        &self,
        audio: &[u8],
        sample_rate: u32,
    ) -> Result<Option<String>, ProviderError>;
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// STT over an OpenAI-compatible HTTP endpoint.
///
/// Transcription is the accelerator-hungry provider: an
/// out-of-memory answer from the endpoint triggers the one-shot
/// device fallback, after which requests pin `device: cpu`.
pub struct HttpSttProvider {
    core: ProviderCore,
    settings: SttSettings,
    client: reqwest::Client,
    device_override: parking_lot::Mutex<Option<&'static str>>,
}

impl HttpSttProvider {
    #[must_use]
    pub fn new(settings: SttSettings, config: ProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self {
            core: ProviderCore::new(format!("stt/{}", settings.model), config),
            settings,
            client,
            device_override: parking_lot::Mutex::new(None),
        }
    }

    async fn request_transcription(
        &self,
        audio_b64: &str,
        sample_rate: u32,
    ) -> Result<String, ProviderError> {
        let mut body = serde_json::json!({
            "model": self.settings.model,
            "language": self.settings.language,
            "audio": audio_b64,
            "encoding": "pcm_s16le",
            "sample_rate": sample_rate,
        });
        if let Some(device) = *self.device_override.lock() {
            body["device"] = serde_json::json!(device);
        }

        let mut request = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.settings.url))
            .json(&body);
        if let Some(ref key) = self.settings.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let lowered = text.to_lowercase();
            if lowered.contains("out of memory") || lowered.contains("cuda") {
                return Err(ProviderError::GpuOutOfMemory(text));
            }
            return Err(ProviderError::Http(format!(
                "transcription returned {status}"
            )));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(parsed.text)
    }
}

#[async_trait]
impl Provider for HttpSttProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn health_check(&self) -> HealthCheck {
        let start = std::time::Instant::now();
        match self
            .client
            .get(format!("{}/health", self.settings.url))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                HealthCheck::healthy(start.elapsed().as_secs_f64() * 1_000.0)
            }
            Ok(response) => HealthCheck::unhealthy(format!("status {}", response.status())),
            Err(e) => HealthCheck::unhealthy(e.to_string()),
        }
    }
}

#[async_trait]
impl SttProvider for HttpSttProvider {
    async fn transcribe(
        &self,
        audio: &[u8],
        sample_rate: u32,
    ) -> Result<Option<String>, ProviderError> {
        if audio.is_empty() {
            return Ok(None);
        }

        let audio_b64 = base64::engine::general_purpose::STANDARD.encode(audio);
        let text = match self
            .core
            .with_retry(|| self.request_transcription(&audio_b64, sample_rate))
            .await
        {
            Ok(text) => text,
            Err(e) if self.core.claim_cpu_fallback(&e) => {
                tracing::warn!(
                    provider = %self.core.name(),
                    "GPU out of memory, falling back to CPU inference"
                );
                *self.device_override.lock() = Some("cpu");
                self.core
                    .with_retry(|| self.request_transcription(&audio_b64, sample_rate))
                    .await?
            }
            Err(e) => return Err(e),
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            tracing::debug!(provider = %self.core.name(), "No speech in utterance");
            return Ok(None);
        }
        Ok(Some(text))
    }
}

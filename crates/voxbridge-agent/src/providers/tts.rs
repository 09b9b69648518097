//! Text-to-speech provider.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::base::{HealthCheck, ProviderConfig, ProviderCore, ProviderError};
use super::Provider;

/// TTS endpoint settings.
#[derive(Debug, Clone)]
pub struct TtsSettings {
    /// Factory key ("http").
    pub provider: String,

    /// Base URL of the speech endpoint.
    pub url: String,

    pub voice: String,
    pub speed: f64,

    /// Sample rate the endpoint is asked to render at.
    pub sample_rate: u32,

    pub api_key: Option<String>,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            provider: "http".to_string(),
            url: "http://127.0.0.1:9100".to_string(),
            voice: "alloy".to_string(),
            speed: 1.0,
            sample_rate: 8_000,
            api_key: None,
        }
    }
}

/// Synthesis contract.
#[async_trait]
pub trait TtsProvider: Provider {
    /// Synthesize a full piece of text into PCM.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ProviderError>;

    /// Whether [`TtsProvider::synthesize_stream`] yields incremental chunks.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Stream PCM chunks as synthesis progresses.
    async fn synthesize_stream(
        &self,
        text: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>, ProviderError> {
        let _ = text;
        Err(ProviderError::Decode(
            "provider does not support streaming".to_string(),
        ))
    }
}

/// TTS over an OpenAI-compatible speech endpoint returning raw PCM.
pub struct HttpTtsProvider {
    core: ProviderCore,
    settings: TtsSettings,
    client: reqwest::Client,
}

impl HttpTtsProvider {
    #[must_use]
    pub fn new(settings: TtsSettings, config: ProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self {
            core: ProviderCore::new(format!("tts/{}", settings.voice), config),
            settings,
            client,
        }
    }

    fn request(&self, text: &str) -> reqwest::RequestBuilder {
        let body = serde_json::json!({
            "input": text,
            "voice": self.settings.voice,
            "speed": self.settings.speed,
            "response_format": "pcm",
            "sample_rate": self.settings.sample_rate,
        });
        let mut request = self
            .client
            .post(format!("{}/v1/audio/speech", self.settings.url))
            .json(&body);
        if let Some(ref key) = self.settings.api_key {
            request = request.bearer_auth(key);
        }
        request
    }

    async fn request_speech(&self, text: &str) -> Result<Vec<u8>, ProviderError> {
        let response = self.request(text).send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::Http(format!(
                "speech returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Provider for HttpTtsProvider {
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
impl TtsProvider for HttpTtsProvider {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ProviderError> {
        self.core.with_retry(|| self.request_speech(text)).await
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn synthesize_stream(
        &self,
        text: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>, ProviderError> {
        self.core.breaker().check()?;

        let response = match self.request(text).send().await {
            Ok(response) if response.status().is_success() => {
                self.core.breaker().record_success();
                response
            }
            Ok(response) => {
                self.core.breaker().record_failure();
                return Err(ProviderError::Http(format!(
                    "speech returned {}",
                    response.status()
                )));
            }
            Err(e) => {
                self.core.breaker().record_failure();
                return Err(e.into());
            }
        };

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                if chunk.is_empty() {
                    continue;
                }
                if tx.send(chunk.to_vec()).await.is_err() {
                    break; // consumer cancelled
                }
            }
        });

        Ok(rx)
    }
}

//! Transcription port.
//!
//! The indexing service runs its own lean STT client — transcription
//! here is latency-tolerant batch work, so there is no streaming path
//! and no circuit breaker, just a timeout and one retry.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use crate::error::TranscribeError;

/// Batch transcription contract.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one utterance; `None` when no speech was heard.
    async fn transcribe(
        &self,
        audio: &[u8],
        sample_rate: u32,
    ) -> Result<Option<String>, TranscribeError>;
}

/// Settings for the HTTP transcriber.
#[derive(Debug, Clone)]
pub struct TranscriberSettings {
    pub url: String,
    pub model: String,
    pub language: String,
    pub timeout: std::time::Duration,
}

impl Default for TranscriberSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9000".to_string(),
            model: "whisper-1".to_string(),
            language: "en".to_string(),
            timeout: std::time::Duration::from_secs(60),
        }
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// STT over an HTTP transcription endpoint.
pub struct HttpTranscriber {
    settings: TranscriberSettings,
    client: reqwest::Client,
}

impl HttpTranscriber {
    #[must_use]
    pub fn new(settings: TranscriberSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .unwrap_or_default();
        Self { settings, client }
    }

    async fn request(&self, audio: &[u8], sample_rate: u32) -> Result<String, TranscribeError> {
        let body = serde_json::json!({
            "model": self.settings.model,
            "language": self.settings.language,
            "audio": base64::engine::general_purpose::STANDARD.encode(audio),
            "encoding": "pcm_s16le",
            "sample_rate": sample_rate,
        });

        let response = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.settings.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| TranscribeError::Transcription(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TranscribeError::Transcription(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| TranscribeError::Transcription(e.to_string()))?;
        Ok(parsed.text)
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(
        &self,
        audio: &[u8],
        sample_rate: u32,
    ) -> Result<Option<String>, TranscribeError> {
        if audio.is_empty() {
            return Ok(None);
        }

        // Indexing is not latency-critical; one retry covers a
        // transient endpoint hiccup.
        let text = match self.request(audio, sample_rate).await {
            Ok(text) => text,
            Err(first) => {
                tracing::warn!(error = %first, "Transcription failed, retrying once");
                self.request(audio, sample_rate).await?
            }
        };

        let text = text.trim().to_string();
        Ok((!text.is_empty()).then_some(text))
    }
}

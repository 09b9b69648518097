//! Language-model provider.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::base::{HealthCheck, ProviderConfig, ProviderCore, ProviderError};
use super::Provider;

/// LLM endpoint settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Factory key ("http").
    pub provider: String,

    /// Base URL of an OpenAI-compatible chat endpoint.
    pub url: String,

    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,

    /// Conversation persona and tool instructions.
    pub system_prompt: String,

    pub api_key: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "http".to_string(),
            url: "http://127.0.0.1:8000".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 256,
            temperature: 0.7,
            system_prompt: "You are a helpful voice assistant on a phone call. \
                            Answer briefly, in complete spoken sentences."
                .to_string(),
            api_key: None,
        }
    }
}

/// Generation contract.
#[async_trait]
pub trait LlmProvider: Provider {
    /// Single-shot generation.
    async fn generate(&self, user_text: &str) -> Result<String, ProviderError>;

    /// Whether [`LlmProvider::generate_stream`] produces real tokens.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Stream token chunks as they are produced.
    ///
    /// The default refuses; callers fall back to [`LlmProvider::generate`].
    async fn generate_stream(
        &self,
        user_text: &str,
    ) -> Result<mpsc::Receiver<String>, ProviderError> {
        let _ = user_text;
        Err(ProviderError::Decode(
            "provider does not support streaming".to_string(),
        ))
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ChunkDelta {
    content: Option<String>,
}

/// LLM over an OpenAI-compatible chat-completions endpoint.
pub struct HttpLlmProvider {
    core: ProviderCore,
    settings: LlmSettings,
    client: reqwest::Client,
}

impl HttpLlmProvider {
    #[must_use]
    pub fn new(settings: LlmSettings, config: ProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self {
            core: ProviderCore::new(format!("llm/{}", settings.model), config),
            settings,
            client,
        }
    }

    fn chat_body(&self, user_text: &str, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
            "stream": stream,
            "messages": [
                {"role": "system", "content": self.settings.system_prompt},
                {"role": "user", "content": user_text},
            ],
        })
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.settings.url))
            .json(body);
        if let Some(ref key) = self.settings.api_key {
            request = request.bearer_auth(key);
        }
        request
    }

    async fn request_completion(&self, user_text: &str) -> Result<String, ProviderError> {
        let response = self.request(&self.chat_body(user_text, false)).send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::Http(format!(
                "chat completion returned {}",
                response.status()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Decode("empty completion".to_string()))
    }
}

#[async_trait]
impl Provider for HttpLlmProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn health_check(&self) -> HealthCheck {
        let start = std::time::Instant::now();
        match self
            .client
            .get(format!("{}/v1/models", self.settings.url))
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
impl LlmProvider for HttpLlmProvider {
    async fn generate(&self, user_text: &str) -> Result<String, ProviderError> {
        self.core
            .with_retry(|| self.request_completion(user_text))
            .await
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn generate_stream(
        &self,
        user_text: &str,
    ) -> Result<mpsc::Receiver<String>, ProviderError> {
        self.core.breaker().check()?;

        let response = match self.request(&self.chat_body(user_text, true)).send().await {
            Ok(response) if response.status().is_success() => {
                self.core.breaker().record_success();
                response
            }
            Ok(response) => {
                self.core.breaker().record_failure();
                return Err(ProviderError::Http(format!(
                    "chat completion returned {}",
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
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are newline-delimited `data: {json}` lines.
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        return;
                    }

                    if let Ok(parsed) = serde_json::from_str::<ChatChunk>(payload) {
                        let delta = parsed
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta.content);
                        if let Some(token) = delta {
                            if tx.send(token).await.is_err() {
                                return; // consumer cancelled
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

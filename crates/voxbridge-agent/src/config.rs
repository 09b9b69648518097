//! Environment-driven configuration.

use std::time::Duration;

use voxbridge_asp::Capabilities;

use crate::pipeline::conversation::EngineConfig;
use crate::pipeline::sentence::SentencePipelineConfig;
use crate::providers::{LlmSettings, ProviderConfig, SttSettings, TtsSettings};

/// Agent service configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub ws_host: String,
    pub ws_port: u16,

    /// Identifier advertised in `protocol.capabilities`.
    pub server_id: String,

    /// Capabilities advertised to connecting clients.
    pub capabilities: Capabilities,

    pub stt: SttSettings,
    pub llm: LlmSettings,
    pub tts: TtsSettings,

    /// Retry + circuit breaker settings shared by all providers.
    pub provider: ProviderConfig,

    pub engine: EngineConfig,

    /// RMS energy above which a frame counts as speech (internal VAD).
    pub vad_energy_threshold: f64,

    /// Idle bound before a session is reaped.
    pub session_max_idle: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ws_host: "0.0.0.0".to_string(),
            ws_port: 8765,
            server_id: "voxbridge-agent".to_string(),
            capabilities: Capabilities::default(),
            stt: SttSettings::default(),
            llm: LlmSettings::default(),
            tts: TtsSettings::default(),
            provider: ProviderConfig::default(),
            engine: EngineConfig::default(),
            vad_energy_threshold: 500.0,
            session_max_idle: Duration::from_secs(300),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let stt = SttSettings {
            provider: env_string("VOXBRIDGE_STT_PROVIDER", &defaults.stt.provider),
            url: env_string("VOXBRIDGE_STT_URL", &defaults.stt.url),
            model: env_string("VOXBRIDGE_STT_MODEL", &defaults.stt.model),
            language: env_string("VOXBRIDGE_STT_LANGUAGE", &defaults.stt.language),
            api_key: std::env::var("VOXBRIDGE_STT_API_KEY").ok(),
        };

        let llm = LlmSettings {
            provider: env_string("VOXBRIDGE_LLM_PROVIDER", &defaults.llm.provider),
            url: env_string("VOXBRIDGE_LLM_URL", &defaults.llm.url),
            model: env_string("VOXBRIDGE_LLM_MODEL", &defaults.llm.model),
            max_tokens: env_u32("VOXBRIDGE_LLM_MAX_TOKENS", defaults.llm.max_tokens),
            temperature: env_f64("VOXBRIDGE_LLM_TEMPERATURE", defaults.llm.temperature),
            system_prompt: env_string("VOXBRIDGE_LLM_SYSTEM_PROMPT", &defaults.llm.system_prompt),
            api_key: std::env::var("VOXBRIDGE_LLM_API_KEY").ok(),
        };

        let tts = TtsSettings {
            provider: env_string("VOXBRIDGE_TTS_PROVIDER", &defaults.tts.provider),
            url: env_string("VOXBRIDGE_TTS_URL", &defaults.tts.url),
            voice: env_string("VOXBRIDGE_TTS_VOICE", &defaults.tts.voice),
            speed: env_f64("VOXBRIDGE_TTS_SPEED", defaults.tts.speed),
            sample_rate: env_u32("VOXBRIDGE_AUDIO_SAMPLE_RATE", defaults.tts.sample_rate),
            api_key: std::env::var("VOXBRIDGE_TTS_API_KEY").ok(),
        };

        let provider = ProviderConfig {
            timeout: Duration::from_secs(env_u64("VOXBRIDGE_LLM_TIMEOUT_S", 30)),
            circuit_failure_threshold: env_u32("VOXBRIDGE_CIRCUIT_FAILURE_THRESHOLD", 3),
            circuit_recovery_timeout: Duration::from_secs(env_u64(
                "VOXBRIDGE_CIRCUIT_RECOVERY_TIMEOUT_S",
                30,
            )),
            circuit_half_open_max_calls: env_u32("VOXBRIDGE_CIRCUIT_HALF_OPEN_MAX_CALLS", 1),
            ..ProviderConfig::default()
        };

        let engine = EngineConfig {
            latency_target_ms: env_f64("VOXBRIDGE_LATENCY_BUDGET_MS", 1_500.0),
            error_phrase: env_string("VOXBRIDGE_ERROR_PHRASE", &defaults.engine.error_phrase),
            sentence: SentencePipelineConfig {
                queue_size: env_u32("VOXBRIDGE_SENTENCE_QUEUE_SIZE", 3) as usize,
                ..SentencePipelineConfig::default()
            },
        };

        Self {
            ws_host: env_string("VOXBRIDGE_WS_HOST", &defaults.ws_host),
            ws_port: env_u32("VOXBRIDGE_WS_PORT", 8_765) as u16,
            server_id: env_string("VOXBRIDGE_SERVER_ID", &defaults.server_id),
            capabilities: Capabilities::default(),
            stt,
            llm,
            tts,
            provider,
            engine,
            vad_energy_threshold: env_f64("VOXBRIDGE_VAD_ENERGY_THRESHOLD", 500.0),
            session_max_idle: Duration::from_secs(env_u64("VOXBRIDGE_SESSION_MAX_IDLE_S", 300)),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_reference_values() {
        let config = AgentConfig::default();
        assert_eq!(config.ws_port, 8_765);
        assert_eq!(config.provider.circuit_failure_threshold, 3);
        assert!((config.engine.latency_target_ms - 1_500.0).abs() < f64::EPSILON);
        assert_eq!(config.engine.sentence.queue_size, 3);
        assert_eq!(config.session_max_idle, Duration::from_secs(300));
    }
}

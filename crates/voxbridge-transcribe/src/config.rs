//! Environment-driven configuration.

use std::time::Duration;

use voxbridge_asp::Capabilities;

use crate::transcriber::TranscriberSettings;

/// Transcription service configuration.
#[derive(Debug, Clone)]
pub struct TranscribeConfig {
    pub ws_host: String,
    pub ws_port: u16,
    pub server_id: String,
    pub capabilities: Capabilities,
    pub stt: TranscriberSettings,

    /// Per-direction buffer cap in seconds of audio.
    pub max_buffer_secs: u32,

    pub session_max_idle: Duration,
}

impl Default for TranscribeConfig {
    fn default() -> Self {
        Self {
            ws_host: "0.0.0.0".to_string(),
            ws_port: 8766,
            server_id: "voxbridge-transcribe".to_string(),
            capabilities: Capabilities {
                // The indexer consumes whatever it is sent; it never
                // tunes the caller's VAD.
                vad_configurable: false,
                features: vec!["dual_direction".to_string()],
                ..Capabilities::default()
            },
            stt: TranscriberSettings::default(),
            max_buffer_secs: 30,
            session_max_idle: Duration::from_secs(600),
        }
    }
}

impl TranscribeConfig {
    /// Load configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ws_host: env_string("VOXBRIDGE_TRANSCRIBE_WS_HOST", &defaults.ws_host),
            ws_port: env_u32("VOXBRIDGE_TRANSCRIBE_WS_PORT", 8_766) as u16,
            server_id: env_string("VOXBRIDGE_TRANSCRIBE_SERVER_ID", &defaults.server_id),
            capabilities: defaults.capabilities,
            stt: TranscriberSettings {
                url: env_string("VOXBRIDGE_STT_URL", &defaults.stt.url),
                model: env_string("VOXBRIDGE_STT_MODEL", &defaults.stt.model),
                language: env_string("VOXBRIDGE_STT_LANGUAGE", &defaults.stt.language),
                timeout: Duration::from_secs(env_u64("VOXBRIDGE_STT_TIMEOUT_S", 60)),
            },
            max_buffer_secs: env_u32("VOXBRIDGE_TRANSCRIBE_MAX_BUFFER_S", 30),
            session_max_idle: Duration::from_secs(env_u64(
                "VOXBRIDGE_SESSION_MAX_IDLE_S",
                600,
            )),
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

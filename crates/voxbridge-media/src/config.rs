//! Environment-driven configuration.
//!
//! A closed set of `VOXBRIDGE_*` variables with recognized effects;
//! anything unset falls back to a default that matches the protocol's
//! reference values. `.env` files are honored via `dotenvy` in `main`.

use std::time::Duration;

use voxbridge_asp::{AudioConfig, AudioEncoding, VadConfig};

use crate::fork::ForkConsumerConfig;

/// Media server configuration.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// ASP endpoint of the conversational service.
    pub agent_url: String,

    /// ASP endpoint of the transcription service (None disables the
    /// secondary fork destination entirely).
    pub transcribe_url: Option<String>,

    /// Fixed audio format on the RTP side.
    pub audio: AudioConfig,

    /// VAD tuning requested of the AI services on session start.
    pub vad: VadConfig,

    /// Ring buffer capacity in milliseconds of audio.
    pub fork_buffer_ms: u32,

    /// Fork consumer tuning.
    pub consumer: ForkConsumerConfig,

    /// Seconds between reconnect attempts after a transport drop.
    pub ws_reconnect_interval: Duration,

    /// Reconnect attempts before a destination is declared down.
    pub ws_max_reconnect_attempts: u32,

    /// Wait for `protocol.capabilities` before falling back to legacy.
    pub caps_timeout: Duration,

    /// Wait for `session.started` before the session fails.
    pub session_start_timeout: Duration,

    /// AMI endpoint (channel control).
    pub ami_host: String,
    pub ami_port: u16,
    pub ami_username: String,
    pub ami_secret: String,

    /// Dialplan context for `call.action` transfers with a bare exten.
    pub ami_transfer_context: String,

    /// Dialplan context a hangup action redirects into.
    pub ami_hangup_context: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            agent_url: "ws://127.0.0.1:8765".to_string(),
            transcribe_url: Some("ws://127.0.0.1:8766".to_string()),
            audio: AudioConfig {
                sample_rate: 8_000,
                encoding: AudioEncoding::PcmS16le,
                channels: 1,
                frame_duration_ms: 20,
            },
            vad: VadConfig::default(),
            fork_buffer_ms: 500,
            consumer: ForkConsumerConfig::default(),
            ws_reconnect_interval: Duration::from_secs(5),
            ws_max_reconnect_attempts: 10,
            caps_timeout: Duration::from_secs(5),
            session_start_timeout: Duration::from_secs(10),
            ami_host: "127.0.0.1".to_string(),
            ami_port: 5038,
            ami_username: "voxbridge".to_string(),
            ami_secret: String::new(),
            ami_transfer_context: "from-internal".to_string(),
            ami_hangup_context: "app-hangup".to_string(),
        }
    }
}

impl MediaConfig {
    /// Load configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let consumer = ForkConsumerConfig {
            poll_interval: Duration::from_millis(env_u64("VOXBRIDGE_FORK_POLL_MS", 10)),
            lag_warn: Duration::from_millis(env_u64("VOXBRIDGE_FORK_LAG_WARN_MS", 100)),
            backoff_initial: Duration::from_millis(env_u64(
                "VOXBRIDGE_FORK_RECONNECT_INITIAL_MS",
                100,
            )),
            backoff_max: Duration::from_millis(env_u64("VOXBRIDGE_FORK_RECONNECT_MAX_MS", 5_000)),
            backoff_multiplier: env_f64("VOXBRIDGE_FORK_RECONNECT_MULTIPLIER", 2.0),
            ..ForkConsumerConfig::default()
        };

        Self {
            agent_url: env_string("VOXBRIDGE_AGENT_URL", &defaults.agent_url),
            transcribe_url: match std::env::var("VOXBRIDGE_TRANSCRIBE_URL") {
                Ok(url) if url.is_empty() => None,
                Ok(url) => Some(url),
                Err(_) => defaults.transcribe_url,
            },
            audio: AudioConfig {
                sample_rate: env_u32("VOXBRIDGE_AUDIO_SAMPLE_RATE", 8_000),
                encoding: AudioEncoding::PcmS16le,
                channels: env_u32("VOXBRIDGE_AUDIO_CHANNELS", 1),
                frame_duration_ms: env_u32("VOXBRIDGE_AUDIO_FRAME_MS", 20),
            },
            vad: VadConfig {
                silence_threshold_ms: env_u32("VOXBRIDGE_VAD_SILENCE_MS", 500),
                min_speech_ms: env_u32("VOXBRIDGE_VAD_MIN_SPEECH_MS", 250),
                ring_buffer_frames: env_u32("VOXBRIDGE_VAD_RING_BUFFER", 5),
                speech_ratio: env_f64("VOXBRIDGE_VAD_SPEECH_RATIO", 0.4),
                ..VadConfig::default()
            },
            fork_buffer_ms: env_u32("VOXBRIDGE_FORK_BUFFER_MS", 500),
            consumer,
            ws_reconnect_interval: Duration::from_secs(env_u64(
                "VOXBRIDGE_WS_RECONNECT_INTERVAL_S",
                5,
            )),
            ws_max_reconnect_attempts: env_u32("VOXBRIDGE_WS_MAX_RECONNECT_ATTEMPTS", 10),
            caps_timeout: Duration::from_secs(env_u64("VOXBRIDGE_ASP_CAPS_TIMEOUT_S", 5)),
            session_start_timeout: Duration::from_secs(env_u64(
                "VOXBRIDGE_ASP_SESSION_START_TIMEOUT_S",
                10,
            )),
            ami_host: env_string("VOXBRIDGE_AMI_HOST", &defaults.ami_host),
            ami_port: env_u32("VOXBRIDGE_AMI_PORT", 5_038) as u16,
            ami_username: env_string("VOXBRIDGE_AMI_USERNAME", &defaults.ami_username),
            ami_secret: env_string("VOXBRIDGE_AMI_SECRET", ""),
            ami_transfer_context: env_string(
                "VOXBRIDGE_AMI_TRANSFER_CONTEXT",
                &defaults.ami_transfer_context,
            ),
            ami_hangup_context: env_string(
                "VOXBRIDGE_AMI_HANGUP_CONTEXT",
                &defaults.ami_hangup_context,
            ),
        }
    }
}

pub(crate) fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub(crate) fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub(crate) fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_reference_values() {
        let config = MediaConfig::default();
        assert_eq!(config.audio.sample_rate, 8_000);
        assert_eq!(config.audio.frame_duration_ms, 20);
        assert_eq!(config.fork_buffer_ms, 500);
        assert_eq!(config.ws_reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.ws_max_reconnect_attempts, 10);
    }
}

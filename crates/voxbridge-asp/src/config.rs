//! Audio and VAD configuration types with validation.
//!
//! These are the negotiable parameters of an ASP session. Validation
//! reports every violation rather than failing on the first, so a
//! `session.started` rejection can carry the full picture.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

/// Sample rates a conforming server may advertise.
pub const VALID_SAMPLE_RATES: [u32; 4] = [8_000, 16_000, 24_000, 48_000];

/// Frame durations a conforming server may advertise (ms).
pub const VALID_FRAME_DURATIONS: [u32; 3] = [10, 20, 30];

pub const VAD_SILENCE_THRESHOLD_RANGE: RangeInclusive<u32> = 100..=2_000;
pub const VAD_MIN_SPEECH_RANGE: RangeInclusive<u32> = 100..=1_000;
pub const VAD_THRESHOLD_RANGE: RangeInclusive<f64> = 0.0..=1.0;
pub const VAD_RING_BUFFER_RANGE: RangeInclusive<u32> = 3..=10;
pub const VAD_SPEECH_RATIO_RANGE: RangeInclusive<f64> = 0.2..=0.8;
pub const VAD_PREFIX_PADDING_RANGE: RangeInclusive<u32> = 0..=500;

/// Audio encoding of a session's PCM payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// 16-bit signed little-endian PCM.
    #[default]
    PcmS16le,

    /// G.711 mu-law.
    Mulaw,

    /// G.711 A-law.
    Alaw,
}

impl AudioEncoding {
    /// Bytes per sample for this encoding.
    #[must_use]
    pub const fn sample_width(self) -> u32 {
        match self {
            Self::PcmS16le => 2,
            Self::Mulaw | Self::Alaw => 1,
        }
    }

    /// Wire name of the encoding (`pcm_s16le`, `mulaw`, `alaw`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PcmS16le => "pcm_s16le",
            Self::Mulaw => "mulaw",
            Self::Alaw => "alaw",
        }
    }
}

/// Audio format of a session.
///
/// Immutable once negotiated — `session.update` may only change VAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// PCM encoding of the payload.
    pub encoding: AudioEncoding,

    /// Channel count (only mono is supported).
    pub channels: u32,

    /// Duration of one audio frame in milliseconds.
    pub frame_duration_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 8_000,
            encoding: AudioEncoding::PcmS16le,
            channels: 1,
            frame_duration_ms: 20,
        }
    }
}

impl AudioConfig {
    /// Validate against the protocol-wide value sets.
    ///
    /// Returns every violation found (empty when valid).
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !VALID_SAMPLE_RATES.contains(&self.sample_rate) {
            errors.push(format!(
                "sample_rate must be one of {VALID_SAMPLE_RATES:?}, got {}",
                self.sample_rate
            ));
        }
        if self.channels != 1 {
            errors.push(format!("channels must be 1, got {}", self.channels));
        }
        if !VALID_FRAME_DURATIONS.contains(&self.frame_duration_ms) {
            errors.push(format!(
                "frame_duration_ms must be one of {VALID_FRAME_DURATIONS:?}, got {}",
                self.frame_duration_ms
            ));
        }

        errors
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    /// Bytes carried by a single frame at this configuration.
    #[must_use]
    pub const fn bytes_per_frame(&self) -> u32 {
        let samples = self.sample_rate * self.frame_duration_ms / 1_000;
        samples * self.encoding.sample_width() * self.channels
    }

    /// Bytes per millisecond of audio at this configuration.
    #[must_use]
    pub const fn bytes_per_ms(&self) -> u32 {
        self.sample_rate * self.encoding.sample_width() * self.channels / 1_000
    }
}

/// Voice-activity-detection tuning for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Whether server-side VAD is active for the session.
    pub enabled: bool,

    /// Continuous silence (ms) that closes an utterance.
    pub silence_threshold_ms: u32,

    /// Minimum utterance length (ms) to be forwarded to STT.
    pub min_speech_ms: u32,

    /// Detection sensitivity (0.0 most sensitive, 1.0 least).
    pub threshold: f64,

    /// Recent-decision window used for smoothing.
    pub ring_buffer_frames: u32,

    /// Fraction of the window that must be speech to count as speech.
    pub speech_ratio: f64,

    /// Audio retained from before the detected speech onset (ms).
    pub prefix_padding_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            silence_threshold_ms: 500,
            min_speech_ms: 250,
            threshold: 0.5,
            ring_buffer_frames: 5,
            speech_ratio: 0.4,
            prefix_padding_ms: 300,
        }
    }
}

impl VadConfig {
    /// Validate every field against its protocol range.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !VAD_SILENCE_THRESHOLD_RANGE.contains(&self.silence_threshold_ms) {
            errors.push(range_error(
                "silence_threshold_ms",
                &VAD_SILENCE_THRESHOLD_RANGE,
                self.silence_threshold_ms,
            ));
        }
        if !VAD_MIN_SPEECH_RANGE.contains(&self.min_speech_ms) {
            errors.push(range_error(
                "min_speech_ms",
                &VAD_MIN_SPEECH_RANGE,
                self.min_speech_ms,
            ));
        }
        if !VAD_THRESHOLD_RANGE.contains(&self.threshold) {
            errors.push(format!(
                "threshold must be within {:?}-{:?}, got {}",
                VAD_THRESHOLD_RANGE.start(),
                VAD_THRESHOLD_RANGE.end(),
                self.threshold
            ));
        }
        if !VAD_RING_BUFFER_RANGE.contains(&self.ring_buffer_frames) {
            errors.push(range_error(
                "ring_buffer_frames",
                &VAD_RING_BUFFER_RANGE,
                self.ring_buffer_frames,
            ));
        }
        if !VAD_SPEECH_RATIO_RANGE.contains(&self.speech_ratio) {
            errors.push(format!(
                "speech_ratio must be within {:?}-{:?}, got {}",
                VAD_SPEECH_RATIO_RANGE.start(),
                VAD_SPEECH_RATIO_RANGE.end(),
                self.speech_ratio
            ));
        }
        if !VAD_PREFIX_PADDING_RANGE.contains(&self.prefix_padding_ms) {
            errors.push(range_error(
                "prefix_padding_ms",
                &VAD_PREFIX_PADDING_RANGE,
                self.prefix_padding_ms,
            ));
        }

        errors
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}

fn range_error(field: &str, range: &RangeInclusive<u32>, got: u32) -> String {
    format!(
        "{field} must be within {}-{}, got {got}",
        range.start(),
        range.end()
    )
}

/// Capabilities advertised by a server in `protocol.capabilities`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Protocol version (semver).
    pub version: String,

    pub supported_sample_rates: Vec<u32>,
    pub supported_encodings: Vec<AudioEncoding>,
    pub supported_frame_durations: Vec<u32>,

    /// Whether the server accepts VAD tuning at all.
    pub vad_configurable: bool,

    /// Names of the VAD fields the server will honor.
    pub vad_parameters: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_session_duration_seconds: Option<u64>,

    /// Feature flags (e.g. `barge_in`, `streaming_tts`).
    pub features: Vec<String>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            supported_sample_rates: vec![8_000, 16_000],
            supported_encodings: vec![AudioEncoding::PcmS16le],
            supported_frame_durations: vec![10, 20, 30],
            vad_configurable: true,
            vad_parameters: vec![
                "silence_threshold_ms".to_string(),
                "min_speech_ms".to_string(),
                "threshold".to_string(),
                "ring_buffer_frames".to_string(),
                "speech_ratio".to_string(),
                "prefix_padding_ms".to_string(),
            ],
            max_session_duration_seconds: Some(3_600),
            features: vec![
                "barge_in".to_string(),
                "streaming_tts".to_string(),
                "sentence_pipeline".to_string(),
            ],
        }
    }
}

impl Capabilities {
    #[must_use]
    pub fn supports_sample_rate(&self, rate: u32) -> bool {
        self.supported_sample_rates.contains(&rate)
    }

    #[must_use]
    pub fn supports_encoding(&self, encoding: AudioEncoding) -> bool {
        self.supported_encodings.contains(&encoding)
    }

    #[must_use]
    pub fn supports_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// One field the negotiator had to change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    /// Dotted field path, e.g. `audio.sample_rate`.
    pub field: String,
    pub requested: serde_json::Value,
    pub applied: serde_json::Value,
    pub reason: String,
}

/// The effective configuration of an accepted session.
///
/// Every field lies within the server's advertised capabilities; every
/// field the server changed appears exactly once in `adjustments`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiatedConfig {
    pub audio: AudioConfig,
    pub vad: VadConfig,

    #[serde(default)]
    pub adjustments: Vec<Adjustment>,
}

impl NegotiatedConfig {
    #[must_use]
    pub fn has_adjustments(&self) -> bool {
        !self.adjustments.is_empty()
    }
}

/// Per-session counters reported in `session.ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SessionStatistics {
    pub audio_frames_received: u64,
    pub audio_frames_sent: u64,
    pub utterances_transcribed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_audio_config_is_valid() {
        assert!(AudioConfig::default().is_valid());
    }

    #[test]
    fn audio_config_rejects_stereo_and_odd_rates() {
        let config = AudioConfig {
            sample_rate: 44_100,
            channels: 2,
            ..AudioConfig::default()
        };
        let errors = config.validate();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn bytes_per_frame_matches_format() {
        // 8 kHz, 16-bit mono, 20 ms => 160 samples => 320 bytes
        assert_eq!(AudioConfig::default().bytes_per_frame(), 320);

        let wideband = AudioConfig {
            sample_rate: 16_000,
            ..AudioConfig::default()
        };
        assert_eq!(wideband.bytes_per_frame(), 640);
    }

    #[test]
    fn default_vad_config_is_valid() {
        assert!(VadConfig::default().is_valid());
    }

    #[test]
    fn vad_config_reports_every_violation() {
        let config = VadConfig {
            silence_threshold_ms: 50,
            min_speech_ms: 5_000,
            threshold: 1.5,
            ring_buffer_frames: 1,
            speech_ratio: 0.9,
            prefix_padding_ms: 900,
            ..VadConfig::default()
        };
        assert_eq!(config.validate().len(), 6);
    }

    #[test]
    fn capabilities_membership_checks() {
        let caps = Capabilities::default();
        assert!(caps.supports_sample_rate(8_000));
        assert!(!caps.supports_sample_rate(24_000));
        assert!(caps.supports_encoding(AudioEncoding::PcmS16le));
        assert!(!caps.supports_encoding(AudioEncoding::Mulaw));
        assert!(caps.supports_feature("barge_in"));
    }

    #[test]
    fn encoding_wire_names() {
        let json = serde_json::to_value(AudioEncoding::PcmS16le).unwrap();
        assert_eq!(json, "pcm_s16le");
        let back: AudioEncoding = serde_json::from_value(json).unwrap();
        assert_eq!(back, AudioEncoding::PcmS16le);
    }
}

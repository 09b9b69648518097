//! Server-side configuration negotiation.
//!
//! The server is the source of truth: a client requesting unsupported
//! parameters gets a working session with a transparent record of what
//! changed, not a stream of handshake failures. Hard failures (no
//! reasonable substitute exists) reject the session instead.

use serde_json::json;

use crate::config::{
    Adjustment, AudioConfig, Capabilities, NegotiatedConfig, VadConfig, VAD_MIN_SPEECH_RANGE,
    VAD_PREFIX_PADDING_RANGE, VAD_RING_BUFFER_RANGE, VAD_SILENCE_THRESHOLD_RANGE,
    VAD_SPEECH_RATIO_RANGE, VAD_THRESHOLD_RANGE,
};
use crate::error::ProtocolError;
use crate::messages::SessionStatus;

/// Outcome of a negotiation round.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationResult {
    pub status: SessionStatus,
    pub negotiated: Option<NegotiatedConfig>,
    pub errors: Vec<ProtocolError>,
}

impl NegotiationResult {
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        self.status.is_accepted()
    }
}

/// Matches requested configuration against server capabilities.
#[derive(Debug, Clone)]
pub struct Negotiator {
    capabilities: Capabilities,
}

impl Negotiator {
    #[must_use]
    pub const fn new(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }

    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Negotiate a requested configuration.
    ///
    /// Out-of-set audio fields are coerced to the closest supported
    /// value; out-of-range VAD fields are clamped to the nearest bound.
    /// Each change produces exactly one [`Adjustment`]. A mandatory
    /// field with no candidate value rejects the session.
    ///
    /// Negotiating an already-negotiated configuration is a fixpoint:
    /// it produces no further adjustments.
    #[must_use]
    pub fn negotiate(
        &self,
        requested_audio: Option<&AudioConfig>,
        requested_vad: Option<&VadConfig>,
    ) -> NegotiationResult {
        let audio = requested_audio.copied().unwrap_or_default();
        let vad = requested_vad.cloned().unwrap_or_default();

        let mut adjustments = Vec::new();
        let mut errors = Vec::new();

        let audio = self.negotiate_audio(audio, &mut adjustments, &mut errors);
        let vad = self.negotiate_vad(vad, &mut adjustments);

        if !errors.is_empty() {
            tracing::warn!(errors = errors.len(), "Session negotiation rejected");
            return NegotiationResult {
                status: SessionStatus::Rejected,
                negotiated: None,
                errors,
            };
        }

        let status = if adjustments.is_empty() {
            SessionStatus::Accepted
        } else {
            for adj in &adjustments {
                tracing::info!(
                    field = %adj.field,
                    requested = %adj.requested,
                    applied = %adj.applied,
                    "Negotiation adjustment"
                );
            }
            SessionStatus::AcceptedWithChanges
        };

        NegotiationResult {
            status,
            negotiated: Some(NegotiatedConfig {
                audio,
                vad,
                adjustments,
            }),
            errors,
        }
    }

    fn negotiate_audio(
        &self,
        requested: AudioConfig,
        adjustments: &mut Vec<Adjustment>,
        errors: &mut Vec<ProtocolError>,
    ) -> AudioConfig {
        let mut audio = requested;

        if !self.capabilities.supports_sample_rate(audio.sample_rate) {
            match self.closest_sample_rate(audio.sample_rate) {
                Some(closest) => {
                    adjustments.push(Adjustment {
                        field: "audio.sample_rate".to_string(),
                        requested: json!(audio.sample_rate),
                        applied: json!(closest),
                        reason: format!(
                            "requested rate not supported, using closest: {closest}Hz"
                        ),
                    });
                    audio.sample_rate = closest;
                }
                None => {
                    errors.push(
                        ProtocolError::audio(
                            2001,
                            format!("sample rate {}Hz not supported", audio.sample_rate),
                        )
                        .with_details(json!({
                            "requested": audio.sample_rate,
                            "supported": self.capabilities.supported_sample_rates,
                        })),
                    );
                }
            }
        }

        if !self.capabilities.supports_encoding(audio.encoding) {
            match self.capabilities.supported_encodings.first() {
                Some(&first) => {
                    adjustments.push(Adjustment {
                        field: "audio.encoding".to_string(),
                        requested: json!(audio.encoding),
                        applied: json!(first),
                        reason: format!(
                            "requested encoding not supported, using: {}",
                            first.as_str()
                        ),
                    });
                    audio.encoding = first;
                }
                None => {
                    errors.push(ProtocolError::audio(
                        2002,
                        "server advertises no supported encodings",
                    ));
                }
            }
        }

        if !self
            .capabilities
            .supported_frame_durations
            .contains(&audio.frame_duration_ms)
        {
            // Prefer 20 ms when available, otherwise the first advertised.
            let fallback = if self.capabilities.supported_frame_durations.contains(&20) {
                Some(20)
            } else {
                self.capabilities.supported_frame_durations.first().copied()
            };
            match fallback {
                Some(duration) => {
                    adjustments.push(Adjustment {
                        field: "audio.frame_duration_ms".to_string(),
                        requested: json!(audio.frame_duration_ms),
                        applied: json!(duration),
                        reason: format!(
                            "requested frame duration not supported, using: {duration}ms"
                        ),
                    });
                    audio.frame_duration_ms = duration;
                }
                None => {
                    errors.push(ProtocolError::audio(
                        2003,
                        "server advertises no supported frame durations",
                    ));
                }
            }
        }

        if audio.channels != 1 {
            adjustments.push(Adjustment {
                field: "audio.channels".to_string(),
                requested: json!(audio.channels),
                applied: json!(1),
                reason: "only mono (1 channel) is supported".to_string(),
            });
            audio.channels = 1;
        }

        audio
    }

    fn negotiate_vad(&self, requested: VadConfig, adjustments: &mut Vec<Adjustment>) -> VadConfig {
        // A server that does not accept VAD tuning imposes its defaults.
        if !self.capabilities.vad_configurable {
            return VadConfig::default();
        }

        let mut vad = requested;

        vad.silence_threshold_ms = clamp_u32(
            "vad.silence_threshold_ms",
            vad.silence_threshold_ms,
            &VAD_SILENCE_THRESHOLD_RANGE,
            adjustments,
        );
        vad.min_speech_ms = clamp_u32(
            "vad.min_speech_ms",
            vad.min_speech_ms,
            &VAD_MIN_SPEECH_RANGE,
            adjustments,
        );
        vad.threshold = clamp_f64(
            "vad.threshold",
            vad.threshold,
            &VAD_THRESHOLD_RANGE,
            adjustments,
        );
        vad.ring_buffer_frames = clamp_u32(
            "vad.ring_buffer_frames",
            vad.ring_buffer_frames,
            &VAD_RING_BUFFER_RANGE,
            adjustments,
        );
        vad.speech_ratio = clamp_f64(
            "vad.speech_ratio",
            vad.speech_ratio,
            &VAD_SPEECH_RATIO_RANGE,
            adjustments,
        );
        vad.prefix_padding_ms = clamp_u32(
            "vad.prefix_padding_ms",
            vad.prefix_padding_ms,
            &VAD_PREFIX_PADDING_RANGE,
            adjustments,
        );

        vad
    }

    fn closest_sample_rate(&self, requested: u32) -> Option<u32> {
        self.capabilities
            .supported_sample_rates
            .iter()
            .copied()
            .min_by_key(|rate| rate.abs_diff(requested))
    }
}

fn clamp_u32(
    field: &str,
    value: u32,
    range: &std::ops::RangeInclusive<u32>,
    adjustments: &mut Vec<Adjustment>,
) -> u32 {
    let clamped = value.clamp(*range.start(), *range.end());
    if clamped != value {
        adjustments.push(Adjustment {
            field: field.to_string(),
            requested: json!(value),
            applied: json!(clamped),
            reason: if value < *range.start() {
                format!("value below minimum ({})", range.start())
            } else {
                format!("value above maximum ({})", range.end())
            },
        });
    }
    clamped
}

fn clamp_f64(
    field: &str,
    value: f64,
    range: &std::ops::RangeInclusive<f64>,
    adjustments: &mut Vec<Adjustment>,
) -> f64 {
    let clamped = value.clamp(*range.start(), *range.end());
    if (clamped - value).abs() > f64::EPSILON {
        adjustments.push(Adjustment {
            field: field.to_string(),
            requested: json!(value),
            applied: json!(clamped),
            reason: format!(
                "value outside {}-{}, clamped to nearest bound",
                range.start(),
                range.end()
            ),
        });
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioEncoding;

    fn negotiator() -> Negotiator {
        Negotiator::new(Capabilities::default())
    }

    #[test]
    fn default_request_is_accepted_unchanged() {
        let result = negotiator().negotiate(None, None);
        assert_eq!(result.status, SessionStatus::Accepted);
        let negotiated = result.negotiated.unwrap();
        assert!(negotiated.adjustments.is_empty());
        assert_eq!(negotiated.audio, AudioConfig::default());
    }

    #[test]
    fn unsupported_sample_rate_downgrades_to_closest() {
        // Capability downgrade scenario: 24 kHz requested against a
        // server that supports only 8/16 kHz.
        let audio = AudioConfig {
            sample_rate: 24_000,
            ..AudioConfig::default()
        };
        let result = negotiator().negotiate(Some(&audio), None);

        assert_eq!(result.status, SessionStatus::AcceptedWithChanges);
        let negotiated = result.negotiated.unwrap();
        assert_eq!(negotiated.audio.sample_rate, 16_000);
        assert_eq!(negotiated.adjustments.len(), 1);

        let adj = &negotiated.adjustments[0];
        assert_eq!(adj.field, "audio.sample_rate");
        assert_eq!(adj.requested, json!(24_000));
        assert_eq!(adj.applied, json!(16_000));
    }

    #[test]
    fn unsupported_encoding_falls_back_to_first_advertised() {
        let audio = AudioConfig {
            encoding: AudioEncoding::Mulaw,
            ..AudioConfig::default()
        };
        let result = negotiator().negotiate(Some(&audio), None);
        let negotiated = result.negotiated.unwrap();
        assert_eq!(negotiated.audio.encoding, AudioEncoding::PcmS16le);
        assert_eq!(negotiated.adjustments.len(), 1);
    }

    #[test]
    fn stereo_is_forced_to_mono() {
        let audio = AudioConfig {
            channels: 2,
            ..AudioConfig::default()
        };
        let result = negotiator().negotiate(Some(&audio), None);
        let negotiated = result.negotiated.unwrap();
        assert_eq!(negotiated.audio.channels, 1);
    }

    #[test]
    fn vad_silence_threshold_is_clamped_to_minimum() {
        // VAD clamp scenario: 50 ms requested, minimum is 100 ms.
        let vad = VadConfig {
            silence_threshold_ms: 50,
            ..VadConfig::default()
        };
        let result = negotiator().negotiate(None, Some(&vad));

        assert_eq!(result.status, SessionStatus::AcceptedWithChanges);
        let negotiated = result.negotiated.unwrap();
        assert_eq!(negotiated.vad.silence_threshold_ms, 100);
        assert_eq!(negotiated.adjustments.len(), 1);
        assert_eq!(negotiated.adjustments[0].field, "vad.silence_threshold_ms");
    }

    #[test]
    fn no_candidate_rejects_the_session() {
        let caps = Capabilities {
            supported_sample_rates: Vec::new(),
            ..Capabilities::default()
        };
        let result = Negotiator::new(caps).negotiate(
            Some(&AudioConfig {
                sample_rate: 44_100,
                ..AudioConfig::default()
            }),
            None,
        );
        assert_eq!(result.status, SessionStatus::Rejected);
        assert!(result.negotiated.is_none());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].code, 2001);
    }

    #[test]
    fn non_configurable_vad_imposes_defaults() {
        let caps = Capabilities {
            vad_configurable: false,
            ..Capabilities::default()
        };
        let vad = VadConfig {
            silence_threshold_ms: 50,
            ..VadConfig::default()
        };
        let result = Negotiator::new(caps).negotiate(None, Some(&vad));
        let negotiated = result.negotiated.unwrap();
        assert_eq!(negotiated.vad, VadConfig::default());
        assert!(negotiated.adjustments.is_empty());
    }

    #[test]
    fn negotiation_is_idempotent() {
        // Re-negotiating a negotiated config must be a fixpoint.
        let negotiator = negotiator();
        let audio = AudioConfig {
            sample_rate: 24_000,
            channels: 2,
            ..AudioConfig::default()
        };
        let vad = VadConfig {
            silence_threshold_ms: 50,
            speech_ratio: 0.95,
            ..VadConfig::default()
        };

        let first = negotiator.negotiate(Some(&audio), Some(&vad));
        let negotiated = first.negotiated.unwrap();

        let second = negotiator.negotiate(Some(&negotiated.audio), Some(&negotiated.vad));
        assert_eq!(second.status, SessionStatus::Accepted);
        assert!(second.negotiated.unwrap().adjustments.is_empty());
    }
}

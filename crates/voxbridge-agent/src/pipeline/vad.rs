//! Utterance buffering with voice-activity detection.
//!
//! Accumulates caller audio into one utterance suitable for STT. Two
//! modes:
//!
//! * **Internal VAD** — per-frame RMS energy decisions smoothed over a
//!   small ring of recent frames; an utterance closes after enough
//!   silence and is discarded when shorter than the minimum.
//! * **External VAD** — the media server detects boundaries; we only
//!   accumulate raw PCM (bounded, keep-most-recent) and flush when the
//!   upstream signals end-of-speech.

use std::collections::VecDeque;

use voxbridge_asp::VadConfig;

/// Utterance buffer tuning beyond the negotiated [`VadConfig`].
#[derive(Debug, Clone)]
pub struct UtteranceBufferConfig {
    pub vad: VadConfig,
    pub sample_rate: u32,
    pub frame_duration_ms: u32,

    /// Upper bound on buffered audio (external mode keeps the most
    /// recent window of this size).
    pub max_buffer_secs: u32,

    /// RMS energy above which a frame counts as speech.
    pub energy_threshold: f64,
}

impl Default for UtteranceBufferConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            sample_rate: 8_000,
            frame_duration_ms: 20,
            max_buffer_secs: 10,
            energy_threshold: 500.0,
        }
    }
}

/// Speech-event buffer for one session.
pub struct UtteranceBuffer {
    config: UtteranceBufferConfig,
    frame_bytes: usize,
    max_bytes: usize,

    buffer: Vec<u8>,
    prefix: VecDeque<Vec<u8>>,
    prefix_max_frames: usize,
    decisions: VecDeque<bool>,
    silence_ms: u32,
    speech_detected: bool,
    truncations: u32,
}

impl UtteranceBuffer {
    #[must_use]
    pub fn new(config: UtteranceBufferConfig) -> Self {
        let frame_bytes =
            (config.sample_rate * config.frame_duration_ms / 1_000) as usize * 2;
        let max_bytes = (config.sample_rate * 2 * config.max_buffer_secs) as usize;
        let prefix_max_frames = (config.vad.prefix_padding_ms / config.frame_duration_ms.max(1))
            as usize;

        Self {
            frame_bytes,
            max_bytes,
            prefix_max_frames,
            buffer: Vec::new(),
            prefix: VecDeque::new(),
            decisions: VecDeque::new(),
            silence_ms: 0,
            speech_detected: false,
            truncations: 0,
            config,
        }
    }

    /// Internal-VAD mode: feed a block of PCM, processing whole frames.
    ///
    /// Returns the complete utterance once speech has been followed by
    /// enough silence (and meets the minimum length).
    pub fn push_audio(&mut self, audio: &[u8]) -> Option<Vec<u8>> {
        let mut result = None;
        let mut offset = 0;

        while offset < audio.len() {
            let end = (offset + self.frame_bytes).min(audio.len());
            let frame = &audio[offset..end];

            if frame.len() < self.frame_bytes {
                // Trailing partial frame: keep it if mid-utterance.
                if self.speech_detected {
                    self.buffer.extend_from_slice(frame);
                }
                break;
            }

            if let Some(utterance) = self.push_frame(frame) {
                result = Some(utterance);
            }
            offset = end;
        }

        result
    }

    /// Internal-VAD mode: process exactly one frame.
    pub fn push_frame(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if self.buffer.len() >= self.max_bytes {
            tracing::warn!("Utterance buffer hit its cap, resetting");
            self.reset();
            return None;
        }

        let is_speech = rms_energy(frame) > self.config.energy_threshold;

        // Smooth over the recent-decision window: a single hot frame
        // (click, pop) must not start an utterance.
        self.decisions.push_back(is_speech);
        while self.decisions.len() > self.config.vad.ring_buffer_frames as usize {
            self.decisions.pop_front();
        }
        let speech_count = self.decisions.iter().filter(|&&d| d).count();
        #[allow(clippy::cast_precision_loss)]
        let smoothed = speech_count as f64 / self.decisions.len() as f64
            >= self.config.vad.speech_ratio;

        if smoothed {
            if !self.speech_detected {
                self.begin_utterance();
            }
            self.silence_ms = 0;
            self.buffer.extend_from_slice(frame);
            return None;
        }

        if !self.speech_detected {
            // Still listening: remember a little pre-speech audio so
            // the utterance keeps its onset.
            if self.prefix_max_frames > 0 {
                self.prefix.push_back(frame.to_vec());
                while self.prefix.len() > self.prefix_max_frames {
                    self.prefix.pop_front();
                }
            }
            return None;
        }

        // Silence inside an utterance.
        self.buffer.extend_from_slice(frame);
        self.silence_ms += self.config.frame_duration_ms;
        if self.silence_ms < self.config.vad.silence_threshold_ms {
            return None;
        }

        self.close_utterance()
    }

    /// External-VAD mode: accumulate without running detection.
    ///
    /// Over the cap, the oldest audio is discarded so the most recent
    /// window survives; the first three truncations and then every
    /// 50th are logged.
    pub fn push_raw(&mut self, audio: &[u8]) {
        let mut audio = audio;
        if audio.len() > self.max_bytes {
            audio = &audio[audio.len() - self.max_bytes..];
            self.buffer.clear();
        }

        let overflow = (self.buffer.len() + audio.len()).saturating_sub(self.max_bytes);
        if overflow > 0 {
            self.truncations += 1;
            if self.truncations <= 3 || self.truncations % 50 == 0 {
                tracing::warn!(
                    overflow_bytes = overflow,
                    truncations = self.truncations,
                    "Utterance buffer over cap, discarding oldest audio"
                );
            }
            self.buffer.drain(..overflow);
        }

        self.buffer.extend_from_slice(audio);
        self.speech_detected = true;
    }

    /// External-VAD mode: upstream signalled end-of-speech.
    ///
    /// Returns the buffered utterance when it meets the minimum
    /// length; either way the buffer resets atomically.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.duration_ms() >= f64::from(self.config.vad.min_speech_ms) {
            let audio = std::mem::take(&mut self.buffer);
            self.reset();
            return Some(audio);
        }
        self.reset();
        None
    }

    #[must_use]
    pub fn has_audio(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Buffered audio length in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        {
            (self.buffer.len() / 2) as f64 / f64::from(self.config.sample_rate) * 1_000.0
        }
    }

    fn begin_utterance(&mut self) {
        self.speech_detected = true;
        self.silence_ms = 0;
        for frame in self.prefix.drain(..) {
            self.buffer.extend_from_slice(&frame);
        }
    }

    fn close_utterance(&mut self) -> Option<Vec<u8>> {
        let duration = self.duration_ms();
        if duration >= f64::from(self.config.vad.min_speech_ms) {
            tracing::debug!(
                duration_ms = format_args!("{duration:.0}"),
                bytes = self.buffer.len(),
                "Utterance closed"
            );
            let audio = std::mem::take(&mut self.buffer);
            self.reset();
            Some(audio)
        } else {
            tracing::debug!(
                duration_ms = format_args!("{duration:.0}"),
                "Utterance below minimum, discarding"
            );
            self.reset();
            None
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.prefix.clear();
        self.decisions.clear();
        self.silence_ms = 0;
        self.speech_detected = false;
    }
}

/// RMS energy of a 16-bit LE frame.
fn rms_energy(frame: &[u8]) -> f64 {
    if frame.len() < 2 {
        return 0.0;
    }
    let sum_squares: f64 = frame
        .chunks_exact(2)
        .map(|pair| {
            let sample = f64::from(i16::from_le_bytes([pair[0], pair[1]]));
            sample * sample
        })
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let count = (frame.len() / 2) as f64;
    (sum_squares / count).sqrt()
}

//! Per-call transcription sessions.
//!
//! Each session keeps two independent PCM buffers — caller→agent and
//! agent→caller — because the two sides of the conversation are
//! transcribed and indexed as separate utterances. Buffers are bounded
//! with keep-most-recent truncation; a flush resets atomically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use voxbridge_asp::{AudioDirection, NegotiatedConfig, SessionHashRegistry, SessionStatistics};

use crate::error::TranscribeError;

/// One direction's bounded accumulator.
struct DirectionBuffer {
    data: Vec<u8>,
    truncations: u32,
}

impl DirectionBuffer {
    const fn new() -> Self {
        Self {
            data: Vec::new(),
            truncations: 0,
        }
    }

    fn push(&mut self, audio: &[u8], max_bytes: usize, label: &str) {
        let mut audio = audio;
        if audio.len() > max_bytes {
            audio = &audio[audio.len() - max_bytes..];
            self.data.clear();
        }

        let overflow = (self.data.len() + audio.len()).saturating_sub(max_bytes);
        if overflow > 0 {
            self.truncations += 1;
            if self.truncations <= 3 || self.truncations % 50 == 0 {
                tracing::warn!(
                    direction = label,
                    overflow_bytes = overflow,
                    truncations = self.truncations,
                    "Transcription buffer over cap, discarding oldest audio"
                );
            }
            self.data.drain(..overflow);
        }
        self.data.extend_from_slice(audio);
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

/// One call being transcribed.
pub struct TranscribeSession {
    pub id: String,
    pub call_id: String,
    pub negotiated: NegotiatedConfig,

    created_at: Instant,
    last_activity: Mutex<Instant>,

    inbound: Mutex<DirectionBuffer>,
    outbound: Mutex<DirectionBuffer>,
    max_buffer_bytes: usize,

    pub frames_received: AtomicU64,
    pub utterances_transcribed: AtomicU64,
}

impl TranscribeSession {
    #[must_use]
    pub fn new(id: String, call_id: String, negotiated: NegotiatedConfig, max_buffer_secs: u32) -> Self {
        let max_buffer_bytes = (negotiated.audio.sample_rate * 2 * max_buffer_secs) as usize;
        Self {
            id,
            call_id,
            negotiated,
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            inbound: Mutex::new(DirectionBuffer::new()),
            outbound: Mutex::new(DirectionBuffer::new()),
            max_buffer_bytes,
            frames_received: AtomicU64::new(0),
            utterances_transcribed: AtomicU64::new(0),
        }
    }

    /// Accumulate one frame into its direction's buffer.
    pub fn push_audio(&self, direction: AudioDirection, audio: &[u8]) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();

        match direction {
            AudioDirection::Inbound => {
                self.inbound
                    .lock()
                    .push(audio, self.max_buffer_bytes, "caller")
            }
            AudioDirection::Outbound => {
                self.outbound
                    .lock()
                    .push(audio, self.max_buffer_bytes, "agent")
            }
        }
    }

    /// Take both accumulated utterances (caller, agent), resetting the
    /// buffers atomically.
    #[must_use]
    pub fn flush(&self) -> (Vec<u8>, Vec<u8>) {
        (self.inbound.lock().take(), self.outbound.lock().take())
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.created_at.elapsed().as_secs_f64()
    }

    #[must_use]
    pub fn statistics(&self) -> SessionStatistics {
        SessionStatistics {
            audio_frames_received: self.frames_received.load(Ordering::Relaxed),
            audio_frames_sent: 0,
            utterances_transcribed: self.utterances_transcribed.load(Ordering::Relaxed),
        }
    }
}

/// Session registry keyed by id and wire hash.
pub struct SessionStore {
    sessions: DashMap<String, Arc<TranscribeSession>>,
    hashes: SessionHashRegistry,
    max_idle: Duration,
    max_buffer_secs: u32,
}

impl SessionStore {
    #[must_use]
    pub fn new(max_idle: Duration, max_buffer_secs: u32) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            hashes: SessionHashRegistry::new(),
            max_idle,
            max_buffer_secs,
        })
    }

    pub fn create(
        &self,
        session_id: &str,
        call_id: &str,
        negotiated: NegotiatedConfig,
    ) -> Result<Arc<TranscribeSession>, TranscribeError> {
        if self.sessions.contains_key(session_id) {
            // The media server retries session starts after reconnects;
            // an existing session is reused rather than rejected.
            tracing::debug!(session = %session_id, "Session already present, reusing");
            return self
                .get(session_id)
                .ok_or_else(|| TranscribeError::UnknownSession(session_id.to_string()));
        }

        let session = Arc::new(TranscribeSession::new(
            session_id.to_string(),
            call_id.to_string(),
            negotiated,
            self.max_buffer_secs,
        ));
        self.sessions
            .insert(session_id.to_string(), Arc::clone(&session));
        self.hashes.register(session_id);

        tracing::info!(session = %session_id, call = %call_id, "Transcription session created");
        Ok(session)
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<TranscribeSession>> {
        self.sessions.get(session_id).map(|s| Arc::clone(&s))
    }

    #[must_use]
    pub fn resolve_hash(&self, hash: &[u8; 8]) -> Option<Arc<TranscribeSession>> {
        let session_id = self.hashes.resolve(hash)?;
        self.get(&session_id)
    }

    pub fn end(&self, session_id: &str) -> Option<Arc<TranscribeSession>> {
        let (_, session) = self.sessions.remove(session_id)?;
        self.hashes.unregister(session_id);
        tracing::info!(
            session = %session_id,
            duration_s = format_args!("{:.1}", session.duration_seconds()),
            utterances = session.utterances_transcribed.load(Ordering::Relaxed),
            "Transcription session ended"
        );
        Some(session)
    }

    pub fn cleanup_stale(&self) -> usize {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.idle_for() > self.max_idle)
            .map(|s| s.key().clone())
            .collect();
        for session_id in &stale {
            tracing::info!(session = %session_id, "Transcription session timed out");
            self.end(session_id);
        }
        stale.len()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxbridge_asp::{session_hash, AudioConfig, VadConfig};

    fn negotiated() -> NegotiatedConfig {
        NegotiatedConfig {
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            adjustments: Vec::new(),
        }
    }

    #[test]
    fn directions_accumulate_independently() {
        let session =
            TranscribeSession::new("s1".to_string(), "call-1".to_string(), negotiated(), 10);

        session.push_audio(AudioDirection::Inbound, &[1u8; 320]);
        session.push_audio(AudioDirection::Inbound, &[1u8; 320]);
        session.push_audio(AudioDirection::Outbound, &[2u8; 320]);

        let (caller, agent) = session.flush();
        assert_eq!(caller.len(), 640);
        assert_eq!(agent.len(), 320);
        assert_eq!(session.frames_received.load(Ordering::Relaxed), 3);

        // Flush resets both.
        let (caller, agent) = session.flush();
        assert!(caller.is_empty());
        assert!(agent.is_empty());
    }

    #[test]
    fn buffers_keep_the_most_recent_window() {
        // 1 second cap = 16 000 bytes at 8 kHz.
        let session =
            TranscribeSession::new("s1".to_string(), "call-1".to_string(), negotiated(), 1);

        session.push_audio(AudioDirection::Inbound, &vec![1u8; 16_000]);
        session.push_audio(AudioDirection::Inbound, &vec![2u8; 8_000]);

        let (caller, _) = session.flush();
        assert_eq!(caller.len(), 16_000);
        assert!(caller.ends_with(&[2u8; 8_000]));
    }

    #[test]
    fn store_registers_and_resolves_both_keys() {
        let store = SessionStore::new(Duration::from_secs(300), 10);
        store.create("s1", "call-1", negotiated()).unwrap();

        assert!(store.get("s1").is_some());
        assert!(store.resolve_hash(&session_hash("s1")).is_some());

        store.end("s1");
        assert!(store.get("s1").is_none());
        assert!(store.resolve_hash(&session_hash("s1")).is_none());
    }

    #[test]
    fn duplicate_create_reuses_the_session() {
        let store = SessionStore::new(Duration::from_secs(300), 10);
        let first = store.create("s1", "call-1", negotiated()).unwrap();
        first.push_audio(AudioDirection::Inbound, &[1u8; 320]);

        let again = store.create("s1", "call-1", negotiated()).unwrap();
        assert_eq!(again.frames_received.load(Ordering::Relaxed), 1);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn stale_sessions_are_reaped() {
        let store = SessionStore::new(Duration::ZERO, 10);
        store.create("s1", "call-1", negotiated()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.cleanup_stale(), 1);
    }
}

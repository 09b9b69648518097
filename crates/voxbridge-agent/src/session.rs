//! Conversation sessions.
//!
//! A session is created on an accepted `session.start` and destroyed
//! on `session.end`, idle timeout, or transport close. Each session is
//! registered under both its full UUID and its 8-byte wire hash; the
//! exact UUID is always preferred on lookup, the hash only resolves
//! binary frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use voxbridge_asp::{NegotiatedConfig, SessionHashRegistry, SessionStatistics};

use crate::error::AgentError;
use crate::pipeline::vad::{UtteranceBuffer, UtteranceBufferConfig};

/// Conversation state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,

    /// Accumulating caller audio.
    Listening,

    /// Utterance closed, pipeline running.
    Processing,

    /// Agent audio streaming out.
    Responding,
}

/// One live conversation.
pub struct Session {
    pub id: String,
    pub call_id: String,
    pub negotiated: NegotiatedConfig,

    state: Mutex<SessionState>,
    created_at: Instant,
    last_activity: Mutex<Instant>,

    /// Caller-audio accumulator.
    pub utterance: Mutex<UtteranceBuffer>,

    pub frames_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub utterances_transcribed: AtomicU64,

    turn_cancel: Mutex<Option<CancellationToken>>,
    current_response: Mutex<Option<String>>,
}

impl Session {
    #[must_use]
    pub fn new(
        id: String,
        call_id: String,
        negotiated: NegotiatedConfig,
        energy_threshold: f64,
    ) -> Self {
        let utterance = UtteranceBuffer::new(UtteranceBufferConfig {
            vad: negotiated.vad.clone(),
            sample_rate: negotiated.audio.sample_rate,
            frame_duration_ms: negotiated.audio.frame_duration_ms,
            energy_threshold,
            ..UtteranceBufferConfig::default()
        });

        Self {
            id,
            call_id,
            negotiated,
            state: Mutex::new(SessionState::Idle),
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            utterance: Mutex::new(utterance),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            utterances_transcribed: AtomicU64::new(0),
            turn_cancel: Mutex::new(None),
            current_response: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set_state(&self, new_state: SessionState) {
        let mut state = self.state.lock();
        if *state != new_state {
            tracing::debug!(session = %self.id, old = ?*state, new = ?new_state, "Session state");
            *state = new_state;
        }
        drop(state);
        self.touch();
    }

    /// Refresh the idle-timeout clock.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
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
            audio_frames_sent: self.frames_sent.load(Ordering::Relaxed),
            utterances_transcribed: self.utterances_transcribed.load(Ordering::Relaxed),
        }
    }

    /// Start a new turn, cancelling any turn still in flight.
    #[must_use]
    pub fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self.turn_cancel.lock().replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }

    /// Cancel the in-flight turn (barge-in). Returns whether one was
    /// actually running.
    pub fn cancel_turn(&self) -> bool {
        self.turn_cancel.lock().take().is_some_and(|token| {
            token.cancel();
            true
        })
    }

    pub fn set_current_response(&self, response_id: Option<String>) {
        *self.current_response.lock() = response_id;
    }

    #[must_use]
    pub fn current_response(&self) -> Option<String> {
        self.current_response.lock().clone()
    }
}

/// Owns every live session plus the wire-hash registry.
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    hashes: SessionHashRegistry,
    max_idle: Duration,
    energy_threshold: f64,
}

impl SessionManager {
    #[must_use]
    pub fn new(max_idle: Duration, energy_threshold: f64) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            hashes: SessionHashRegistry::new(),
            max_idle,
            energy_threshold,
        })
    }

    /// Create and register a session. A duplicate id is a protocol
    /// error and must not disturb the existing session.
    pub fn create(
        &self,
        session_id: &str,
        call_id: &str,
        negotiated: NegotiatedConfig,
    ) -> Result<Arc<Session>, AgentError> {
        if self.sessions.contains_key(session_id) {
            return Err(AgentError::DuplicateSession(session_id.to_string()));
        }

        let session = Arc::new(Session::new(
            session_id.to_string(),
            call_id.to_string(),
            negotiated,
            self.energy_threshold,
        ));
        self.sessions
            .insert(session_id.to_string(), Arc::clone(&session));
        self.hashes.register(session_id);

        tracing::info!(session = %session_id, call = %call_id, "Session created");
        Ok(session)
    }

    /// Exact-UUID lookup.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| Arc::clone(&s))
    }

    /// Wire-hash lookup (binary frames only).
    #[must_use]
    pub fn resolve_hash(&self, hash: &[u8; 8]) -> Option<Arc<Session>> {
        let session_id = self.hashes.resolve(hash)?;
        self.get(&session_id)
    }

    /// End a session, returning (duration s, statistics) when it existed.
    pub fn end(&self, session_id: &str, reason: &str) -> Option<(f64, SessionStatistics)> {
        let (_, session) = self.sessions.remove(session_id)?;
        session.cancel_turn();
        self.hashes.unregister(session_id);

        let duration = session.duration_seconds();
        let stats = session.statistics();
        tracing::info!(
            session = %session_id,
            reason = %reason,
            duration_s = format_args!("{duration:.1}"),
            utterances = stats.utterances_transcribed,
            "Session ended"
        );
        Some((duration, stats))
    }

    /// Drop sessions idle past the configured bound.
    pub fn cleanup_stale(&self) -> usize {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.idle_for() > self.max_idle)
            .map(|s| s.key().clone())
            .collect();

        for session_id in &stale {
            tracing::info!(session = %session_id, "Session timed out");
            self.end(session_id, "timeout");
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

    fn manager() -> Arc<SessionManager> {
        SessionManager::new(Duration::from_secs(300), 500.0)
    }

    #[test]
    fn create_registers_both_keys() {
        let mgr = manager();
        let id = uuid::Uuid::new_v4().to_string();
        mgr.create(&id, "call-1", negotiated()).unwrap();

        assert!(mgr.get(&id).is_some());
        assert!(mgr.resolve_hash(&session_hash(&id)).is_some());
        assert_eq!(mgr.count(), 1);
    }

    #[test]
    fn duplicate_id_is_rejected_without_state_change() {
        let mgr = manager();
        let session = mgr.create("s1", "call-1", negotiated()).unwrap();
        session.frames_received.store(7, Ordering::Relaxed);

        let err = mgr.create("s1", "call-2", negotiated());
        assert!(matches!(err, Err(AgentError::DuplicateSession(_))));

        // The original session is untouched.
        let existing = mgr.get("s1").unwrap();
        assert_eq!(existing.frames_received.load(Ordering::Relaxed), 7);
        assert_eq!(existing.call_id, "call-1");
    }

    #[test]
    fn end_returns_stats_and_unregisters() {
        let mgr = manager();
        let session = mgr.create("s1", "call-1", negotiated()).unwrap();
        session.utterances_transcribed.store(3, Ordering::Relaxed);

        let (duration, stats) = mgr.end("s1", "hangup").unwrap();
        assert!(duration >= 0.0);
        assert_eq!(stats.utterances_transcribed, 3);
        assert!(mgr.get("s1").is_none());
        assert!(mgr.resolve_hash(&session_hash("s1")).is_none());

        // Second end is a no-op.
        assert!(mgr.end("s1", "hangup").is_none());
    }

    #[test]
    fn stale_sessions_are_cleaned_up() {
        let mgr = SessionManager::new(Duration::ZERO, 500.0);
        mgr.create("s1", "call-1", negotiated()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.cleanup_stale(), 1);
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn begin_turn_cancels_the_previous_turn() {
        let session = Session::new("s1".to_string(), "call-1".to_string(), negotiated(), 500.0);
        let first = session.begin_turn();
        assert!(!first.is_cancelled());

        let second = session.begin_turn();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        assert!(session.cancel_turn());
        assert!(second.is_cancelled());
        assert!(!session.cancel_turn());
    }

    #[test]
    fn state_transitions_touch_activity() {
        let session = Session::new("s1".to_string(), "call-1".to_string(), negotiated(), 500.0);
        assert_eq!(session.state(), SessionState::Idle);
        session.set_state(SessionState::Listening);
        assert_eq!(session.state(), SessionState::Listening);
        assert!(session.idle_for() < Duration::from_secs(1));
    }
}

//! Fork session lifecycle and the media-path entry point.
//!
//! [`MediaForkManager::fork_audio`] is the only call the RTP callback
//! makes. It is synchronous, wait-free and never panics: a sharded map
//! lookup, an atomic flag check and a ring-buffer push. Everything
//! else (session lifecycle, transcription forwarding) runs on the
//! async side.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use voxbridge_asp::AudioConfig;

use crate::error::MediaError;
use crate::fork::consumer::{ForkConsumer, ForkConsumerConfig};
use crate::ports::AudioDestination;
use crate::ring_buffer::{BufferMetrics, RingBuffer};

/// Fork core configuration.
#[derive(Debug, Clone)]
pub struct ForkConfig {
    /// Master switch; when off, `fork_audio` returns `false` silently.
    pub enabled: bool,

    /// Ring buffer capacity per session (milliseconds of audio).
    pub buffer_ms: u32,

    /// Audio format of the RTP side.
    pub audio: AudioConfig,

    /// Consumer tuning shared by all sessions.
    pub consumer: ForkConsumerConfig,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_ms: 500,
            audio: AudioConfig::default(),
            consumer: ForkConsumerConfig::default(),
        }
    }
}

struct SessionFork {
    call_id: String,
    buffer: Arc<RingBuffer>,
    consumer: Arc<ForkConsumer>,
    active: AtomicBool,
    fallback: AtomicBool,
    frames_forked: AtomicU64,
}

/// Point-in-time view of one fork session.
#[derive(Debug, Clone)]
pub struct SessionForkMetrics {
    pub call_id: String,
    pub frames_forked: u64,
    pub fallback_active: bool,
    pub buffer: BufferMetrics,
}

/// Owns every fork session; one instance per process.
pub struct MediaForkManager {
    config: ForkConfig,
    primary: Arc<dyn AudioDestination>,
    secondary: Option<Arc<dyn AudioDestination>>,
    sessions: DashMap<String, Arc<SessionFork>>,
    fallback_count: AtomicUsize,
}

impl MediaForkManager {
    #[must_use]
    pub fn new(
        config: ForkConfig,
        primary: Arc<dyn AudioDestination>,
        secondary: Option<Arc<dyn AudioDestination>>,
    ) -> Self {
        tracing::info!(
            enabled = config.enabled,
            buffer_ms = config.buffer_ms,
            transcribe = secondary.is_some(),
            "Media fork manager created"
        );
        Self {
            config,
            primary,
            secondary,
            sessions: DashMap::new(),
            fallback_count: AtomicUsize::new(0),
        }
    }

    /// Fork one frame of caller audio into the session's buffer.
    ///
    /// Called from the real-time media thread: wait-free, no I/O, no
    /// allocation beyond the frame copy. Returns `false` when the
    /// session is unknown, paused, or forking is disabled — silently,
    /// because the media path must not care.
    pub fn fork_audio(&self, session_id: &str, audio: &[u8]) -> bool {
        if !self.config.enabled {
            return false;
        }

        let Some(session) = self.sessions.get(session_id) else {
            return false;
        };

        if !session.active.load(Ordering::Relaxed) {
            return false;
        }

        session.buffer.push(session_id, audio.to_vec());
        session.frames_forked.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Create the ring buffer and consumer for a new call.
    pub async fn start_session(&self, session_id: &str, call_id: &str) -> Result<(), MediaError> {
        if !self.config.enabled {
            return Ok(());
        }

        if self.sessions.contains_key(session_id) {
            tracing::warn!(session = %session_id, "Fork session already exists");
            return Ok(());
        }

        let buffer = Arc::new(RingBuffer::new(self.config.buffer_ms, &self.config.audio));
        let consumer = ForkConsumer::new(
            session_id.to_string(),
            Arc::clone(&buffer),
            Arc::clone(&self.primary),
            self.secondary.clone(),
            self.config.consumer.clone(),
        );
        consumer.start();

        self.sessions.insert(
            session_id.to_string(),
            Arc::new(SessionFork {
                call_id: call_id.to_string(),
                buffer,
                consumer,
                active: AtomicBool::new(true),
                fallback: AtomicBool::new(false),
                frames_forked: AtomicU64::new(0),
            }),
        );

        // The transcription session is best-effort: the call proceeds
        // whether or not the indexing side is reachable.
        if let Some(ref transcribe) = self.secondary {
            if transcribe.is_connected() {
                if let Err(e) = transcribe.start_session(session_id, call_id).await {
                    tracing::warn!(
                        session = %session_id,
                        error = %e,
                        "Failed to start transcription session"
                    );
                }
            }
        }

        tracing::info!(session = %session_id, call = %call_id, "Fork session started");
        Ok(())
    }

    /// Tear down a session. Idempotent.
    pub async fn stop_session(&self, session_id: &str) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            tracing::warn!(session = %session_id, "Fork session not found on stop");
            return;
        };

        session.consumer.stop().await;

        if let Some(ref transcribe) = self.secondary {
            if transcribe.is_connected() {
                if let Err(e) = transcribe.end_session(session_id, "hangup").await {
                    tracing::debug!(
                        session = %session_id,
                        error = %e,
                        "Failed to end transcription session"
                    );
                }
            }
        }

        if session.fallback.load(Ordering::Relaxed) {
            self.fallback_count.fetch_sub(1, Ordering::Relaxed);
        }

        let metrics = session.buffer.metrics();
        tracing::info!(
            session = %session_id,
            forked = session.frames_forked.load(Ordering::Relaxed),
            dropped = metrics.frames_dropped,
            drop_rate = format_args!("{:.2}%", metrics.drop_rate() * 100.0),
            "Fork session stopped"
        );
    }

    /// Suppress forking without tearing the session down.
    pub fn pause_session(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            session.active.store(false, Ordering::Relaxed);
            tracing::debug!(session = %session_id, "Fork paused");
        }
    }

    /// Resume forking; the buffer is cleared so stale audio is never
    /// replayed into the analysis path.
    pub fn resume_session(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            let discarded = session.buffer.clear();
            session.active.store(true, Ordering::Relaxed);
            tracing::debug!(session = %session_id, discarded, "Fork resumed");
        }
    }

    /// Mark the session as running without its AI path.
    pub fn activate_fallback(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            if !session.fallback.swap(true, Ordering::Relaxed) {
                self.fallback_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(session = %session_id, "Fallback mode activated");
            }
        }
    }

    /// Clear the fallback flag once the AI path is healthy again.
    pub fn deactivate_fallback(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            if session.fallback.swap(false, Ordering::Relaxed) {
                self.fallback_count.fetch_sub(1, Ordering::Relaxed);
                tracing::info!(session = %session_id, "Fallback mode deactivated");
            }
        }
    }

    /// Forward caller end-of-speech to the transcription destination.
    ///
    /// The conversational side receives this on its own channel.
    pub async fn send_audio_end(&self, session_id: &str) {
        if !self.sessions.contains_key(session_id) {
            return;
        }
        if let Some(ref transcribe) = self.secondary {
            if transcribe.is_connected() {
                if let Err(e) = transcribe.send_speech_end(session_id).await {
                    tracing::debug!(session = %session_id, error = %e, "speech_end forward failed");
                }
            }
        }
    }

    /// Forward one frame of agent audio to the transcription destination.
    pub async fn send_outbound_audio(&self, session_id: &str, audio: &[u8]) -> bool {
        if !self.config.enabled || !self.sessions.contains_key(session_id) {
            return false;
        }
        if let Some(ref transcribe) = self.secondary {
            if transcribe.is_connected() {
                match transcribe.send_outbound_audio(session_id, audio).await {
                    Ok(()) => return true,
                    Err(e) => {
                        tracing::debug!(
                            session = %session_id,
                            error = %e,
                            "Outbound audio forward failed"
                        );
                    }
                }
            }
        }
        false
    }

    /// Forward agent end-of-speech to the transcription destination.
    pub async fn send_outbound_audio_end(&self, session_id: &str) {
        self.send_audio_end(session_id).await;
    }

    /// Stop every session (process shutdown).
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            self.stop_session(&id).await;
        }
        tracing::info!("Media fork manager shut down");
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn fallback_sessions(&self) -> usize {
        self.fallback_count.load(Ordering::Relaxed)
    }

    /// Metrics snapshot for one session.
    #[must_use]
    pub fn session_metrics(&self, session_id: &str) -> Option<SessionForkMetrics> {
        self.sessions.get(session_id).map(|s| SessionForkMetrics {
            call_id: s.call_id.clone(),
            frames_forked: s.frames_forked.load(Ordering::Relaxed),
            fallback_active: s.fallback.load(Ordering::Relaxed),
            buffer: s.buffer.metrics(),
        })
    }
}

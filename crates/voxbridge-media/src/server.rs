//! Media server wiring.
//!
//! Glues the fork core, the two ASP destinations, per-session playback
//! queues and the AMI client into the object the telephony stack talks
//! to. The SIP/RTP side is an external collaborator: it delivers 20 ms
//! PCM frames and speech boundary events, and pulls one outbound frame
//! per tick.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use voxbridge_asp::{timestamp_now, AspMessage, CallAction};

use crate::ami::AmiClient;
use crate::config::MediaConfig;
use crate::error::MediaError;
use crate::fork::{ForkConfig, MediaForkManager};
use crate::playback::{PlaybackFrame, PlaybackQueue, PlaybackState};
use crate::ports::AudioDestination;
use crate::ws_client::{ClientEvent, WsDestination, WsDestinationConfig};

struct CallState {
    /// External channel identifier (used for AMI Redirect).
    channel: String,
    playback: Arc<PlaybackQueue>,
}

/// The per-process media bridge.
pub struct MediaServer {
    config: MediaConfig,
    fork: MediaForkManager,
    agent: Arc<WsDestination>,
    ami: AmiClient,
    calls: DashMap<String, CallState>,
}

impl MediaServer {
    /// Build the server and its destination connections.
    ///
    /// Returns the server plus the agent and (optional) transcription
    /// event streams; the caller drives them via [`Self::handle_agent_event`].
    #[must_use]
    pub fn new(
        config: MediaConfig,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<ClientEvent>,
        Option<mpsc::Receiver<ClientEvent>>,
    ) {
        let (agent, agent_events) = WsDestination::spawn(WsDestinationConfig {
            name: "agent".to_string(),
            url: config.agent_url.clone(),
            audio: config.audio,
            vad: config.vad.clone(),
            caps_timeout: config.caps_timeout,
            session_start_timeout: config.session_start_timeout,
            reconnect_interval: config.ws_reconnect_interval,
            max_reconnect_attempts: config.ws_max_reconnect_attempts,
        });

        let (transcribe, transcribe_events) = match config.transcribe_url {
            Some(ref url) => {
                let (dest, events) = WsDestination::spawn(WsDestinationConfig {
                    name: "transcribe".to_string(),
                    url: url.clone(),
                    audio: config.audio,
                    vad: config.vad.clone(),
                    caps_timeout: config.caps_timeout,
                    session_start_timeout: config.session_start_timeout,
                    reconnect_interval: config.ws_reconnect_interval,
                    max_reconnect_attempts: config.ws_max_reconnect_attempts,
                });
                (Some(dest), Some(events))
            }
            None => (None, None),
        };

        let fork = MediaForkManager::new(
            ForkConfig {
                enabled: true,
                buffer_ms: config.fork_buffer_ms,
                audio: config.audio,
                consumer: config.consumer.clone(),
            },
            Arc::clone(&agent) as Arc<dyn AudioDestination>,
            transcribe.map(|t| t as Arc<dyn AudioDestination>),
        );

        let ami = AmiClient::new(
            config.ami_host.clone(),
            config.ami_port,
            config.ami_username.clone(),
            config.ami_secret.clone(),
        );

        let server = Arc::new(Self {
            config,
            fork,
            agent,
            ami,
            calls: DashMap::new(),
        });

        (server, agent_events, transcribe_events)
    }

    /// Connect the AMI side (best-effort; redirects reconnect lazily).
    pub async fn connect_ami(&self) {
        if let Err(e) = self.ami.connect().await {
            tracing::warn!(error = %e, "AMI connect failed, will retry on demand");
        }
    }

    // ── Call lifecycle (driven by the SIP stack) ───────────────────

    /// A call went up: open the agent session and the fork path.
    pub async fn start_call(&self, session_id: &str, channel: &str) -> Result<(), MediaError> {
        let playback = Arc::new(PlaybackQueue::new(
            self.config.audio.bytes_per_frame() as usize,
            true,
        ));
        self.calls.insert(
            session_id.to_string(),
            CallState {
                channel: channel.to_string(),
                playback,
            },
        );

        // The conversational session failing is surfaced — the SIP side
        // decides whether to keep the call up in fallback mode.
        let agent_result = self.agent.start_session(session_id, channel).await;

        self.fork.start_session(session_id, channel).await?;

        if let Err(e) = agent_result {
            self.fork.activate_fallback(session_id);
            return Err(e);
        }

        tracing::info!(session = %session_id, channel = %channel, "Call started");
        Ok(())
    }

    /// A call went down: tear everything down. Idempotent.
    pub async fn end_call(&self, session_id: &str) {
        if self.calls.remove(session_id).is_none() {
            return;
        }

        if let Err(e) = self.agent.end_session(session_id, "hangup").await {
            tracing::debug!(session = %session_id, error = %e, "Agent session end failed");
        }
        self.fork.stop_session(session_id).await;
        tracing::info!(session = %session_id, "Call ended");
    }

    // ── Media path (real-time thread) ──────────────────────────────

    /// Fork one caller frame. The only call the RTP callback makes.
    pub fn on_rtp_frame(&self, session_id: &str, audio: &[u8]) -> bool {
        self.fork.fork_audio(session_id, audio)
    }

    /// Pull the next outbound frame for the RTP tick.
    #[must_use]
    pub fn next_playback_frame(&self, session_id: &str) -> PlaybackFrame {
        self.calls
            .get(session_id)
            .map_or(PlaybackFrame::Silence, |call| call.playback.next_frame())
    }

    // ── Speech boundary events (from the external VAD) ─────────────

    /// Caller started speaking.
    ///
    /// If the agent is mid-response this is a barge-in: the playback
    /// queue is dropped atomically before the next outbound frame and
    /// the agent is told so it can cancel the in-flight response.
    pub async fn on_caller_speech_start(&self, session_id: &str) {
        if let Some(call) = self.calls.get(session_id) {
            let cleared = call.playback.clear();
            call.playback.set_state(PlaybackState::Idle);
            if cleared > 0 {
                tracing::info!(session = %session_id, cleared_bytes = cleared, "Barge-in");
            }
        }

        let msg = AspMessage::SpeechStart {
            session_id: session_id.to_string(),
            timestamp: timestamp_now(),
        };
        if let Err(e) = self.agent.send_control(msg).await {
            tracing::debug!(session = %session_id, error = %e, "speech_start send failed");
        }
    }

    /// Caller stopped speaking: close the utterance on both paths.
    pub async fn on_caller_speech_end(&self, session_id: &str) {
        if let Some(call) = self.calls.get(session_id) {
            call.playback.set_state(PlaybackState::Processing);
        }
        if let Err(e) = self.agent.send_speech_end(session_id).await {
            tracing::debug!(session = %session_id, error = %e, "speech_end send failed");
        }
        self.fork.send_audio_end(session_id).await;
    }

    // ── Agent events ───────────────────────────────────────────────

    /// Apply one event from the conversational service.
    pub async fn handle_agent_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::Connected { legacy } => {
                tracing::info!(legacy, "Agent destination connected");
                for call in &self.calls {
                    self.fork.deactivate_fallback(call.key());
                }
            }
            ClientEvent::Disconnected => {
                // Calls stay up; callers hear comfort noise until the
                // agent comes back.
                for call in &self.calls {
                    self.fork.activate_fallback(call.key());
                }
            }
            ClientEvent::ResponseStart { session_id, response_id } => {
                tracing::debug!(session = %session_id, response = %response_id, "Response started");
                if let Some(call) = self.calls.get(&session_id) {
                    call.playback.set_state(PlaybackState::Responding);
                }
            }
            ClientEvent::ResponseAudio { session_id, payload } => {
                if let Some(call) = self.calls.get(&session_id) {
                    call.playback.push(&payload);
                }
                // Mirror agent audio to the transcription path.
                self.fork.send_outbound_audio(&session_id, &payload).await;
            }
            ClientEvent::ResponseEnd { session_id, response_id, interrupted } => {
                tracing::debug!(
                    session = %session_id,
                    response = %response_id,
                    interrupted,
                    "Response ended"
                );
                if let Some(call) = self.calls.get(&session_id) {
                    call.playback.flush_partial();
                    call.playback.set_state(PlaybackState::Idle);
                }
                self.fork.send_outbound_audio_end(&session_id).await;
            }
            ClientEvent::ResponseInterrupted { session_id, response_id } => {
                tracing::info!(session = %session_id, response = %response_id, "Response interrupted");
                if let Some(call) = self.calls.get(&session_id) {
                    call.playback.clear();
                }
            }
            ClientEvent::CallAction { session_id, action, target, reason } => {
                self.execute_call_action(&session_id, action, target.as_deref(), reason.as_deref())
                    .await;
            }
            ClientEvent::TextUtterance { session_id, speaker, text } => {
                tracing::info!(session = %session_id, speaker = ?speaker, text = %text, "Transcript");
            }
            ClientEvent::ProtocolError { session_id, error } => {
                tracing::warn!(
                    session = ?session_id,
                    code = error.code,
                    message = %error.message,
                    "Protocol error from agent"
                );
            }
            ClientEvent::SessionEnded { session_id } => {
                tracing::info!(session = %session_id, "Agent closed the session");
            }
        }
    }

    /// Execute a `call.action` through AMI.
    async fn execute_call_action(
        &self,
        session_id: &str,
        action: CallAction,
        target: Option<&str>,
        reason: Option<&str>,
    ) {
        let Some(call) = self.calls.get(session_id) else {
            tracing::warn!(session = %session_id, "call.action for unknown session");
            return;
        };
        let channel = call.channel.clone();
        drop(call);

        tracing::info!(
            session = %session_id,
            channel = %channel,
            action = ?action,
            target = ?target,
            reason = ?reason,
            "Executing call action"
        );

        // `target` is "context,exten" or a bare extension in the
        // configured transfer context.
        let (context, exten) = match action {
            CallAction::Transfer => match target {
                Some(target) => match target.split_once(',') {
                    Some((context, exten)) => (context.to_string(), exten.to_string()),
                    None => (self.config.ami_transfer_context.clone(), target.to_string()),
                },
                None => {
                    tracing::warn!(session = %session_id, "Transfer without target, ignoring");
                    return;
                }
            },
            CallAction::Hangup => (self.config.ami_hangup_context.clone(), "s".to_string()),
        };

        match self.ami.redirect(&channel, &context, &exten, 1).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::error!(session = %session_id, "Call action rejected by Asterisk");
            }
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "Call action failed");
            }
        }
    }

    /// Graceful shutdown: end every call, close transports.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.calls.iter().map(|c| c.key().clone()).collect();
        for id in ids {
            self.end_call(&id).await;
        }
        self.fork.shutdown().await;
        self.agent.shutdown();
        self.ami.close().await;
    }

    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub const fn fork(&self) -> &MediaForkManager {
        &self.fork
    }
}

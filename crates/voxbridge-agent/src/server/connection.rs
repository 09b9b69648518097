//! Per-connection protocol handling.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use voxbridge_asp::{
    encode_frame, parse_frame, timestamp_now, AspError, AspMessage, AudioDirection, Negotiator,
    ProtocolError, SessionStatus, Speaker,
};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::pipeline::conversation::{ConversationEngine, TurnEvent};
use crate::providers::ProviderPool;
use crate::session::{Session, SessionManager, SessionState};

/// The conversational ASP server.
pub struct AgentServer {
    config: AgentConfig,
    negotiator: Negotiator,
    sessions: Arc<SessionManager>,
    engine: Arc<ConversationEngine>,
}

impl AgentServer {
    #[must_use]
    pub fn new(config: AgentConfig, pool: Arc<ProviderPool>) -> Arc<Self> {
        let negotiator = Negotiator::new(config.capabilities.clone());
        let sessions = SessionManager::new(config.session_max_idle, config.vad_energy_threshold);
        let engine = Arc::new(ConversationEngine::new(pool, config.engine.clone()));

        Arc::new(Self {
            config,
            negotiator,
            sessions,
            engine,
        })
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Bind and serve until the process is stopped.
    pub async fn run(self: Arc<Self>) -> Result<(), AgentError> {
        let addr = format!("{}:{}", self.config.ws_host, self.config.ws_port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "Agent server listening");
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), AgentError> {
        // Idle sessions are reaped in the background.
        let reaper_sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                reaper_sessions.cleanup_stale();
            }
        });

        loop {
            let (stream, addr) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.handle_connection(stream, addr).await;
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "WebSocket handshake failed");
                return;
            }
        };
        tracing::info!(peer = %addr, "Client connected");

        let (mut sink, mut source) = ws.split();

        // All writers funnel through one channel so turn tasks and the
        // dispatch loop never contend on the sink.
        let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(256);
        let sender_task = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Exactly one capabilities announcement, before anything else.
        let caps = AspMessage::capabilities(
            self.config.capabilities.clone(),
            Some(self.config.server_id.clone()),
        );
        if msg_tx.send(Message::Text(caps.to_json())).await.is_err() {
            sender_task.abort();
            return;
        }

        // Sessions created on this connection, for teardown on close.
        let mut owned_sessions: HashSet<String> = HashSet::new();

        while let Some(incoming) = source.next().await {
            match incoming {
                Ok(Message::Text(text)) => {
                    self.handle_control(&text, &msg_tx, &mut owned_sessions).await;
                }
                Ok(Message::Binary(data)) => {
                    self.handle_audio(&data, &msg_tx).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {} // ping/pong
                Err(e) => {
                    tracing::warn!(peer = %addr, error = %e, "WebSocket read error");
                    break;
                }
            }
        }

        for session_id in owned_sessions {
            self.sessions.end(&session_id, "transport_closed");
        }
        sender_task.abort();
        tracing::info!(peer = %addr, "Client disconnected");
    }

    async fn handle_control(
        &self,
        text: &str,
        msg_tx: &mpsc::Sender<Message>,
        owned_sessions: &mut HashSet<String>,
    ) {
        let msg = match AspMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                let error = match &e {
                    AspError::UnknownType(t) => {
                        ProtocolError::protocol(1001, format!("unknown message type: {t}"))
                    }
                    AspError::Malformed { .. } => ProtocolError::protocol(1002, e.to_string()),
                    _ => ProtocolError::protocol(1000, e.to_string()),
                };
                send_control(msg_tx, &AspMessage::error(error, None)).await;
                return;
            }
        };

        match msg {
            AspMessage::SessionStart {
                session_id,
                call_id,
                audio,
                vad,
                ..
            } => {
                self.handle_session_start(
                    &session_id,
                    call_id.as_deref(),
                    audio.as_ref(),
                    vad.as_ref(),
                    msg_tx,
                    owned_sessions,
                )
                .await;
            }

            AspMessage::SessionUpdate { session_id, vad, .. } => {
                let Some(session) = self.sessions.get(&session_id) else {
                    self.unknown_session(&session_id, msg_tx).await;
                    return;
                };

                // Audio is immutable mid-session (the parser enforces
                // absence); only VAD is renegotiated.
                let result = self.negotiator.negotiate(Some(&session.negotiated.audio), Some(&vad));
                let reply = AspMessage::SessionUpdated {
                    session_id: session_id.clone(),
                    status: result.status,
                    negotiated: result.negotiated,
                    errors: (!result.errors.is_empty()).then_some(result.errors),
                    timestamp: timestamp_now(),
                };
                session.touch();
                send_control(msg_tx, &reply).await;
            }

            AspMessage::SessionEnd {
                session_id, reason, ..
            } => {
                let reason = reason.unwrap_or_else(|| "user_end".to_string());
                match self.sessions.end(&session_id, &reason) {
                    Some((duration, statistics)) => {
                        owned_sessions.remove(&session_id);
                        let reply = AspMessage::SessionEnded {
                            session_id,
                            duration_seconds: Some(duration),
                            statistics: Some(statistics),
                            timestamp: timestamp_now(),
                        };
                        send_control(msg_tx, &reply).await;
                    }
                    None => self.unknown_session(&session_id, msg_tx).await,
                }
            }

            AspMessage::SpeechStart { session_id, .. } => {
                let Some(session) = self.sessions.get(&session_id) else {
                    self.unknown_session(&session_id, msg_tx).await;
                    return;
                };
                self.handle_barge_in(&session, msg_tx).await;
            }

            AspMessage::SpeechEnd { session_id, .. } => {
                let Some(session) = self.sessions.get(&session_id) else {
                    self.unknown_session(&session_id, msg_tx).await;
                    return;
                };

                // External VAD closed the utterance.
                let utterance = session.utterance.lock().flush();
                if let Some(utterance) = utterance {
                    self.spawn_turn(&session, utterance, msg_tx.clone());
                } else {
                    session.set_state(SessionState::Listening);
                }
            }

            other => {
                tracing::debug!(message = other.type_name(), "Ignoring control message");
            }
        }
    }

    async fn handle_session_start(
        &self,
        session_id: &str,
        call_id: Option<&str>,
        audio: Option<&voxbridge_asp::AudioConfig>,
        vad: Option<&voxbridge_asp::VadConfig>,
        msg_tx: &mpsc::Sender<Message>,
        owned_sessions: &mut HashSet<String>,
    ) {
        let result = self.negotiator.negotiate(audio, vad);

        if !result.is_accepted() {
            let reply = AspMessage::SessionStarted {
                session_id: session_id.to_string(),
                status: SessionStatus::Rejected,
                negotiated: None,
                errors: Some(result.errors),
                timestamp: timestamp_now(),
            };
            send_control(msg_tx, &reply).await;
            return;
        }

        let negotiated = result
            .negotiated
            .clone()
            .unwrap_or_else(|| voxbridge_asp::NegotiatedConfig {
                audio: voxbridge_asp::AudioConfig::default(),
                vad: voxbridge_asp::VadConfig::default(),
                adjustments: Vec::new(),
            });

        let call_id = call_id.unwrap_or(session_id);
        match self.sessions.create(session_id, call_id, negotiated) {
            Ok(session) => {
                owned_sessions.insert(session_id.to_string());
                session.set_state(SessionState::Listening);

                let reply = AspMessage::SessionStarted {
                    session_id: session_id.to_string(),
                    status: result.status,
                    negotiated: result.negotiated,
                    errors: None,
                    timestamp: timestamp_now(),
                };
                send_control(msg_tx, &reply).await;
            }
            Err(AgentError::DuplicateSession(_)) => {
                let error = ProtocolError::session(
                    4002,
                    format!("session already exists: {session_id}"),
                );
                send_control(
                    msg_tx,
                    &AspMessage::error(error, Some(session_id.to_string())),
                )
                .await;
            }
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "Session create failed");
                let error = ProtocolError::session(4000, e.to_string());
                send_control(
                    msg_tx,
                    &AspMessage::error(error, Some(session_id.to_string())),
                )
                .await;
            }
        }
    }

    async fn handle_audio(&self, data: &[u8], msg_tx: &mpsc::Sender<Message>) {
        let frame = match parse_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "Bad audio frame");
                return;
            }
        };

        if frame.direction != AudioDirection::Inbound {
            return;
        }

        // Unknown hash: drop, not fatal.
        let Some(session) = self.sessions.resolve_hash(&frame.session_hash) else {
            tracing::debug!(hash = %frame.hash_hex(), "Frame for unknown session");
            return;
        };

        session.frames_received.fetch_add(1, Ordering::Relaxed);
        session.touch();

        if session.negotiated.vad.enabled {
            // Internal VAD: the buffer closes utterances on its own.
            // Speech arriving mid-response is a barge-in.
            let utterance = session.utterance.lock().push_audio(frame.payload);
            if let Some(utterance) = utterance {
                if session.state() == SessionState::Responding {
                    self.handle_barge_in(&session, msg_tx).await;
                }
                self.spawn_turn(&session, utterance, msg_tx.clone());
            }
        } else {
            // External VAD: accumulate until audio.speech_end.
            session.utterance.lock().push_raw(frame.payload);
        }
    }

    /// Caller spoke over the agent: cancel the in-flight response.
    async fn handle_barge_in(&self, session: &Arc<Session>, msg_tx: &mpsc::Sender<Message>) {
        if session.state() == SessionState::Responding {
            if session.cancel_turn() {
                tracing::info!(session = %session.id, "Barge-in, cancelling response");
            }
            if let Some(response_id) = session.current_response() {
                let msg = AspMessage::ResponseInterrupted {
                    session_id: session.id.clone(),
                    response_id,
                    timestamp: timestamp_now(),
                };
                send_control(msg_tx, &msg).await;
            }
        }
        session.set_state(SessionState::Listening);
    }

    /// Run one turn in the background, translating its events into
    /// wire messages.
    fn spawn_turn(&self, session: &Arc<Session>, utterance: Vec<u8>, msg_tx: mpsc::Sender<Message>) {
        let speech_ended_at = Instant::now();
        let cancel = session.begin_turn();
        session.set_state(SessionState::Processing);
        session
            .utterances_transcribed
            .fetch_add(1, Ordering::Relaxed);

        let (events_tx, mut events_rx) = mpsc::channel::<TurnEvent>(32);
        let engine = Arc::clone(&self.engine);
        let sample_rate = session.negotiated.audio.sample_rate;
        let session_id = session.id.clone();
        tokio::spawn(async move {
            engine
                .run_turn(
                    &session_id,
                    utterance,
                    sample_rate,
                    speech_ended_at,
                    cancel,
                    events_tx,
                )
                .await;
        });

        let session = Arc::clone(session);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    TurnEvent::Transcript(text) => {
                        let msg = AspMessage::TextUtterance {
                            session_id: session.id.clone(),
                            speaker: Speaker::Caller,
                            text,
                            timestamp: timestamp_now(),
                        };
                        send_control(&msg_tx, &msg).await;
                    }
                    TurnEvent::ResponseStarted { response_id } => {
                        session.set_state(SessionState::Responding);
                        session.set_current_response(Some(response_id.clone()));
                        let msg = AspMessage::ResponseStart {
                            session_id: session.id.clone(),
                            response_id,
                            timestamp: timestamp_now(),
                        };
                        send_control(&msg_tx, &msg).await;
                    }
                    TurnEvent::Audio { chunk } => {
                        session.frames_sent.fetch_add(1, Ordering::Relaxed);
                        let frame = encode_frame(&session.id, &chunk, AudioDirection::Outbound);
                        if msg_tx.send(Message::Binary(frame)).await.is_err() {
                            break;
                        }
                    }
                    TurnEvent::ResponseEnded {
                        response_id,
                        interrupted,
                    } => {
                        session.set_current_response(None);
                        if session.state() == SessionState::Responding {
                            session.set_state(SessionState::Listening);
                        }
                        let msg = AspMessage::ResponseEnd {
                            session_id: session.id.clone(),
                            response_id,
                            interrupted,
                            timestamp: timestamp_now(),
                        };
                        send_control(&msg_tx, &msg).await;
                    }
                    TurnEvent::CallAction(request) => {
                        let msg = AspMessage::CallActionMsg {
                            session_id: session.id.clone(),
                            action: request.action,
                            target: request.target,
                            reason: request.reason,
                            timestamp: timestamp_now(),
                        };
                        send_control(&msg_tx, &msg).await;
                    }
                }
            }

            // A turn that produced no response (empty transcript, STT
            // failure) leaves the session in Processing; listen again.
            if session.state() == SessionState::Processing {
                session.set_state(SessionState::Listening);
            }
        });
    }

    async fn unknown_session(&self, session_id: &str, msg_tx: &mpsc::Sender<Message>) {
        let error = ProtocolError::session(4001, format!("unknown session: {session_id}"));
        send_control(
            msg_tx,
            &AspMessage::error(error, Some(session_id.to_string())),
        )
        .await;
    }
}

async fn send_control(msg_tx: &mpsc::Sender<Message>, msg: &AspMessage) {
    if msg_tx.send(Message::Text(msg.to_json())).await.is_err() {
        tracing::debug!(message = msg.type_name(), "Connection gone, message dropped");
    }
}

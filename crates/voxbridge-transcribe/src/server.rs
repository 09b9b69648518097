//! ASP server for the transcription side.
//!
//! Same wire shape as the conversational service — capabilities on
//! connect, negotiation, hash-resolved binary frames — but both
//! directions of audio are accepted and there is no response path:
//! `audio.speech_end` flushes whatever each direction has accumulated
//! into the transcriber and on to the sink.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use voxbridge_asp::{
    parse_frame, timestamp_now, AspError, AspMessage, Negotiator, ProtocolError, SessionStatus,
    Speaker,
};

use crate::config::TranscribeConfig;
use crate::error::TranscribeError;
use crate::session::{SessionStore, TranscribeSession};
use crate::sink::{TranscriptRecord, TranscriptSink};
use crate::transcriber::Transcriber;

/// The transcription ASP server.
pub struct TranscribeServer {
    config: TranscribeConfig,
    negotiator: Negotiator,
    sessions: Arc<SessionStore>,
    transcriber: Arc<dyn Transcriber>,
    sink: Arc<dyn TranscriptSink>,
}

impl TranscribeServer {
    #[must_use]
    pub fn new(
        config: TranscribeConfig,
        transcriber: Arc<dyn Transcriber>,
        sink: Arc<dyn TranscriptSink>,
    ) -> Arc<Self> {
        let negotiator = Negotiator::new(config.capabilities.clone());
        let sessions = SessionStore::new(config.session_max_idle, config.max_buffer_secs);
        Arc::new(Self {
            config,
            negotiator,
            sessions,
            transcriber,
            sink,
        })
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Bind and serve until the process is stopped.
    pub async fn run(self: Arc<Self>) -> Result<(), TranscribeError> {
        let addr = format!("{}:{}", self.config.ws_host, self.config.ws_port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "Transcription server listening");
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), TranscribeError> {
        let reaper = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                reaper.cleanup_stale();
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
        tracing::info!(peer = %addr, "Media server connected");

        let (mut sink, mut source) = ws.split();
        let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(256);
        let sender_task = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let caps = AspMessage::capabilities(
            self.config.capabilities.clone(),
            Some(self.config.server_id.clone()),
        );
        if msg_tx.send(Message::Text(caps.to_json())).await.is_err() {
            sender_task.abort();
            return;
        }

        let mut owned_sessions: HashSet<String> = HashSet::new();

        while let Some(incoming) = source.next().await {
            match incoming {
                Ok(Message::Text(text)) => {
                    self.handle_control(&text, &msg_tx, &mut owned_sessions).await;
                }
                Ok(Message::Binary(data)) => self.handle_audio(&data),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(peer = %addr, error = %e, "WebSocket read error");
                    break;
                }
            }
        }

        for session_id in owned_sessions {
            self.finish_session(&session_id).await;
        }
        sender_task.abort();
        tracing::info!(peer = %addr, "Media server disconnected");
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
                    _ => ProtocolError::protocol(1000, e.to_string()),
                };
                let _ = msg_tx
                    .send(Message::Text(AspMessage::error(error, None).to_json()))
                    .await;
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
                let result = self.negotiator.negotiate(audio.as_ref(), vad.as_ref());
                let reply = if result.is_accepted() {
                    let negotiated = result.negotiated.clone().unwrap_or_else(|| {
                        voxbridge_asp::NegotiatedConfig {
                            audio: voxbridge_asp::AudioConfig::default(),
                            vad: voxbridge_asp::VadConfig::default(),
                            adjustments: Vec::new(),
                        }
                    });
                    let call_id = call_id.unwrap_or_else(|| session_id.clone());
                    match self.sessions.create(&session_id, &call_id, negotiated) {
                        Ok(_) => {
                            owned_sessions.insert(session_id.clone());
                            AspMessage::SessionStarted {
                                session_id,
                                status: result.status,
                                negotiated: result.negotiated,
                                errors: None,
                                timestamp: timestamp_now(),
                            }
                        }
                        Err(e) => AspMessage::error(
                            ProtocolError::session(4000, e.to_string()),
                            Some(session_id),
                        ),
                    }
                } else {
                    AspMessage::SessionStarted {
                        session_id,
                        status: SessionStatus::Rejected,
                        negotiated: None,
                        errors: Some(result.errors),
                        timestamp: timestamp_now(),
                    }
                };
                let _ = msg_tx.send(Message::Text(reply.to_json())).await;
            }

            AspMessage::SessionEnd { session_id, .. } => match self.sessions.get(&session_id) {
                Some(_) => {
                    owned_sessions.remove(&session_id);
                    self.finish_session(&session_id).await;
                    if let Some(session) = self.sessions.end(&session_id) {
                        let reply = AspMessage::SessionEnded {
                            session_id,
                            duration_seconds: Some(session.duration_seconds()),
                            statistics: Some(session.statistics()),
                            timestamp: timestamp_now(),
                        };
                        let _ = msg_tx.send(Message::Text(reply.to_json())).await;
                    }
                }
                None => {
                    let error =
                        ProtocolError::session(4001, format!("unknown session: {session_id}"));
                    let _ = msg_tx
                        .send(Message::Text(
                            AspMessage::error(error, Some(session_id)).to_json(),
                        ))
                        .await;
                }
            },

            AspMessage::SpeechEnd { session_id, .. } => {
                let Some(session) = self.sessions.get(&session_id) else {
                    let error =
                        ProtocolError::session(4001, format!("unknown session: {session_id}"));
                    let _ = msg_tx
                        .send(Message::Text(
                            AspMessage::error(error, Some(session_id)).to_json(),
                        ))
                        .await;
                    return;
                };
                self.flush_and_index(&session).await;
            }

            other => {
                tracing::debug!(message = other.type_name(), "Ignoring control message");
            }
        }
    }

    fn handle_audio(&self, data: &[u8]) {
        let frame = match parse_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "Bad audio frame");
                return;
            }
        };

        let Some(session) = self.sessions.resolve_hash(&frame.session_hash) else {
            tracing::debug!(hash = %frame.hash_hex(), "Frame for unknown session");
            return;
        };

        session.push_audio(frame.direction, frame.payload);
    }

    /// Transcribe and index whatever both directions have buffered.
    async fn flush_and_index(&self, session: &Arc<TranscribeSession>) {
        let (caller, agent) = session.flush();
        let sample_rate = session.negotiated.audio.sample_rate;

        for (speaker, audio) in [(Speaker::Caller, caller), (Speaker::Agent, agent)] {
            if audio.is_empty() {
                continue;
            }

            #[allow(clippy::cast_precision_loss)]
            let duration_ms = (audio.len() / 2) as f64 / f64::from(sample_rate) * 1_000.0;

            match self.transcriber.transcribe(&audio, sample_rate).await {
                Ok(Some(text)) => {
                    session.utterances_transcribed.fetch_add(1, Ordering::Relaxed);
                    let record = TranscriptRecord {
                        session_id: session.id.clone(),
                        call_id: session.call_id.clone(),
                        speaker,
                        text,
                        timestamp: timestamp_now(),
                        audio_duration_ms: duration_ms,
                    };
                    if let Err(e) = self.sink.index(record).await {
                        tracing::warn!(session = %session.id, error = %e, "Indexing failed");
                    }
                }
                Ok(None) => {
                    tracing::debug!(session = %session.id, speaker = ?speaker, "No speech");
                }
                Err(e) => {
                    tracing::warn!(session = %session.id, error = %e, "Transcription failed");
                }
            }
        }
    }

    /// Flush any tail audio before the session goes away.
    async fn finish_session(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            self.flush_and_index(&session).await;
        }
    }
}

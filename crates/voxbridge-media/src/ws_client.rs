//! WebSocket client toward an AI service.
//!
//! Owns one connection per destination, drives the ASP handshake
//! (capabilities wait with legacy fallback, session negotiation) and
//! reconnects on transport drop: fixed interval, capped attempts, full
//! session re-establishment — the protocol has no resume.
//!
//! Inbound traffic is surfaced as [`ClientEvent`]s; the fork core sends
//! caller audio through the [`AudioDestination`] implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use voxbridge_asp::{
    encode_frame, parse_frame, timestamp_now, AspMessage, AudioConfig, AudioDirection,
    CallAction, ProtocolError, SessionHashRegistry, Speaker, VadConfig,
};

use crate::asp_client::AspClientHandler;
use crate::error::MediaError;
use crate::ports::AudioDestination;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound traffic and connection state changes from one destination.
#[derive(Debug)]
pub enum ClientEvent {
    Connected { legacy: bool },
    Disconnected,

    /// Agent began a spoken response.
    ResponseStart { session_id: String, response_id: String },

    /// One frame of agent audio (agent→caller).
    ResponseAudio { session_id: String, payload: Vec<u8> },

    /// Agent finished (or abandoned) a spoken response.
    ResponseEnd {
        session_id: String,
        response_id: String,
        interrupted: bool,
    },

    /// Agent acknowledged a barge-in.
    ResponseInterrupted { session_id: String, response_id: String },

    /// Agent requested a channel-control action.
    CallAction {
        session_id: String,
        action: CallAction,
        target: Option<String>,
        reason: Option<String>,
    },

    /// Final transcript line (for call logs).
    TextUtterance {
        session_id: String,
        speaker: Speaker,
        text: String,
    },

    /// Server-side protocol error.
    ProtocolError {
        session_id: Option<String>,
        error: ProtocolError,
    },

    /// Server closed a session on its own initiative.
    SessionEnded { session_id: String },
}

/// Connection tuning for one destination.
#[derive(Debug, Clone)]
pub struct WsDestinationConfig {
    /// Short name for logs ("agent", "transcribe").
    pub name: String,

    pub url: String,

    /// Default audio/VAD configuration requested on session start.
    pub audio: AudioConfig,
    pub vad: VadConfig,

    pub caps_timeout: Duration,
    pub session_start_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

/// One ASP destination over a self-healing WebSocket.
pub struct WsDestination {
    config: WsDestinationConfig,
    connected: AtomicBool,
    reconnect_count: AtomicU32,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<AspMessage>>>,
    handler: Mutex<AspClientHandler>,
    hashes: SessionHashRegistry,
    events_tx: mpsc::Sender<ClientEvent>,
    cancel: CancellationToken,
}

impl WsDestination {
    /// Create the destination and spawn its connection task.
    ///
    /// Returns the destination and the stream of [`ClientEvent`]s.
    #[must_use]
    pub fn spawn(config: WsDestinationConfig) -> (Arc<Self>, mpsc::Receiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);

        let destination = Arc::new(Self {
            config,
            connected: AtomicBool::new(false),
            reconnect_count: AtomicU32::new(0),
            sender: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            handler: Mutex::new(AspClientHandler::new()),
            hashes: SessionHashRegistry::new(),
            events_tx,
            cancel: CancellationToken::new(),
        });

        let task = Arc::clone(&destination);
        tokio::spawn(async move {
            task.run().await;
        });

        (destination, events_rx)
    }

    /// Stop the connection task and close the socket.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    /// Send an arbitrary control message.
    pub async fn send_control(&self, msg: AspMessage) -> Result<(), MediaError> {
        self.send_text(msg.to_json()).await
    }

    /// Send a VAD-only `session.update`.
    pub async fn update_session(&self, session_id: &str, vad: VadConfig) -> Result<(), MediaError> {
        let msg = AspMessage::SessionUpdate {
            session_id: session_id.to_string(),
            vad,
            timestamp: timestamp_now(),
        };
        self.send_text(msg.to_json()).await
    }

    // ── Connection loop ────────────────────────────────────────────

    async fn run(self: Arc<Self>) {
        let mut attempts: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match connect_async(self.config.url.as_str()).await {
                Ok((stream, _)) => {
                    attempts = 0;
                    tracing::info!(
                        destination = %self.config.name,
                        url = %self.config.url,
                        "Connected"
                    );
                    self.serve_connection(stream).await;
                    self.on_disconnect().await;
                    self.reconnect_count.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    attempts += 1;
                    self.reconnect_count.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        destination = %self.config.name,
                        attempt = attempts,
                        max = self.config.max_reconnect_attempts,
                        error = %e,
                        "Connection failed"
                    );
                    if attempts >= self.config.max_reconnect_attempts {
                        tracing::error!(
                            destination = %self.config.name,
                            "Reconnect attempts exhausted, giving up"
                        );
                        break;
                    }
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
    }

    async fn serve_connection(&self, stream: WsStream) {
        let (mut sink, mut source) = stream.split();

        // Step 1: the server announces capabilities, or we assume a
        // legacy peer and proceed without negotiation.
        let legacy = match tokio::time::timeout(self.config.caps_timeout, source.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match AspMessage::parse(&text) {
                Ok(AspMessage::ProtocolCapabilities { capabilities, .. }) => {
                    self.handler.lock().record_capabilities(capabilities);
                    false
                }
                Ok(other) => {
                    tracing::warn!(
                        destination = %self.config.name,
                        got = other.type_name(),
                        "Expected capabilities, assuming legacy server"
                    );
                    self.handler.lock().enter_legacy_mode();
                    true
                }
                Err(e) => {
                    tracing::warn!(
                        destination = %self.config.name,
                        error = %e,
                        "Unparseable greeting, assuming legacy server"
                    );
                    self.handler.lock().enter_legacy_mode();
                    true
                }
            },
            Ok(Some(Ok(_)) | Some(Err(_)) | None) => {
                self.handler.lock().enter_legacy_mode();
                true
            }
            Err(_) => {
                self.handler.lock().enter_legacy_mode();
                true
            }
        };

        let (tx, mut rx) = mpsc::channel::<Message>(64);
        *self.sender.lock() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        self.emit(ClientEvent::Connected { legacy }).await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                outgoing = rx.recv() => {
                    let Some(msg) = outgoing else { break };
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                        Some(Ok(Message::Binary(data))) => self.handle_binary(&data).await,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {} // ping/pong
                        Some(Err(e)) => {
                            tracing::warn!(
                                destination = %self.config.name,
                                error = %e,
                                "WebSocket read error"
                            );
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn on_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.sender.lock() = None;

        // Closing the socket fails every in-flight session.started wait.
        self.pending.lock().clear();
        self.handler.lock().reset();

        self.emit(ClientEvent::Disconnected).await;
        tracing::warn!(destination = %self.config.name, "Disconnected");
    }

    async fn handle_text(&self, text: &str) {
        let msg = match AspMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(destination = %self.config.name, error = %e, "Bad control message");
                return;
            }
        };

        // Handshake answers are routed to their waiting caller.
        if matches!(
            msg,
            AspMessage::SessionStarted { .. } | AspMessage::SessionUpdated { .. }
        ) {
            let waiter = msg
                .session_id()
                .and_then(|id| self.pending.lock().remove(id));
            if let Some(waiter) = waiter {
                let _ = waiter.send(msg);
                return;
            }
            // No waiter: a fire-and-forget update answer still refreshes
            // the stored configuration.
            if matches!(msg, AspMessage::SessionUpdated { .. }) {
                let _ = self.handler.lock().process_session_updated(&msg);
                return;
            }
        }

        let event = match msg {
            AspMessage::ResponseStart {
                session_id,
                response_id,
                ..
            } => Some(ClientEvent::ResponseStart {
                session_id,
                response_id,
            }),
            AspMessage::ResponseEnd {
                session_id,
                response_id,
                interrupted,
                ..
            } => Some(ClientEvent::ResponseEnd {
                session_id,
                response_id,
                interrupted,
            }),
            AspMessage::ResponseInterrupted {
                session_id,
                response_id,
                ..
            } => Some(ClientEvent::ResponseInterrupted {
                session_id,
                response_id,
            }),
            AspMessage::CallActionMsg {
                session_id,
                action,
                target,
                reason,
                ..
            } => Some(ClientEvent::CallAction {
                session_id,
                action,
                target,
                reason,
            }),
            AspMessage::TextUtterance {
                session_id,
                speaker,
                text,
                ..
            } => Some(ClientEvent::TextUtterance {
                session_id,
                speaker,
                text,
            }),
            AspMessage::ProtocolErrorMsg {
                error, session_id, ..
            } => {
                tracing::warn!(
                    destination = %self.config.name,
                    code = error.code,
                    message = %error.message,
                    "Protocol error from server"
                );
                Some(ClientEvent::ProtocolError { session_id, error })
            }
            AspMessage::SessionEnded { session_id, .. } => {
                self.handler.lock().remove_session(&session_id);
                Some(ClientEvent::SessionEnded { session_id })
            }
            other => {
                tracing::debug!(
                    destination = %self.config.name,
                    message = other.type_name(),
                    "Ignoring control message"
                );
                None
            }
        };

        if let Some(event) = event {
            self.emit(event).await;
        }
    }

    async fn handle_binary(&self, data: &[u8]) {
        let frame = match parse_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(destination = %self.config.name, error = %e, "Bad audio frame");
                return;
            }
        };

        // Only agent→caller audio flows toward the media server.
        if frame.direction != AudioDirection::Outbound {
            return;
        }

        let Some(session_id) = self.hashes.resolve(&frame.session_hash) else {
            tracing::debug!(
                destination = %self.config.name,
                hash = %frame.hash_hex(),
                "Audio frame for unknown session, dropping"
            );
            return;
        };

        self.emit(ClientEvent::ResponseAudio {
            session_id,
            payload: frame.payload.to_vec(),
        })
        .await;
    }

    async fn emit(&self, event: ClientEvent) {
        if self.events_tx.send(event).await.is_err() {
            tracing::warn!(destination = %self.config.name, "Event receiver dropped");
        }
    }

    async fn send_text(&self, text: String) -> Result<(), MediaError> {
        self.send_message(Message::Text(text)).await
    }

    async fn send_message(&self, msg: Message) -> Result<(), MediaError> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| MediaError::NotConnected(self.config.name.clone()))?;
        sender
            .send(msg)
            .await
            .map_err(|_| MediaError::NotConnected(self.config.name.clone()))
    }
}

#[async_trait]
impl AudioDestination for WsDestination {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start_session(&self, session_id: &str, call_id: &str) -> Result<(), MediaError> {
        let msg = self.handler.lock().build_session_start(
            session_id,
            call_id,
            &self.config.audio,
            &self.config.vad,
        );

        let (answer_tx, answer_rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(session_id.to_string(), answer_tx);

        self.send_text(msg.to_json()).await?;

        let answer =
            match tokio::time::timeout(self.config.session_start_timeout, answer_rx).await {
                Ok(Ok(answer)) => answer,
                Ok(Err(_)) => {
                    // Waiter dropped: the transport closed underneath us.
                    return Err(MediaError::NotConnected(self.config.name.clone()));
                }
                Err(_) => {
                    self.pending.lock().remove(session_id);
                    return Err(MediaError::Timeout("session.started"));
                }
            };

        self.handler
            .lock()
            .process_session_started(&answer, Some(call_id.to_string()))?;
        self.hashes.register(session_id);
        Ok(())
    }

    async fn end_session(&self, session_id: &str, reason: &str) -> Result<(), MediaError> {
        // Fire-and-forget: we do not wait for session.ended.
        let msg = self.handler.lock().build_session_end(session_id, reason);
        let result = self.send_text(msg.to_json()).await;
        self.handler.lock().remove_session(session_id);
        self.hashes.unregister(session_id);
        result
    }

    async fn send_audio(&self, session_id: &str, audio: &[u8]) -> Result<(), MediaError> {
        self.send_message(Message::Binary(encode_frame(
            session_id,
            audio,
            AudioDirection::Inbound,
        )))
        .await
    }

    async fn send_speech_end(&self, session_id: &str) -> Result<(), MediaError> {
        let msg = AspMessage::SpeechEnd {
            session_id: session_id.to_string(),
            duration_ms: None,
            timestamp: timestamp_now(),
        };
        self.send_text(msg.to_json()).await
    }

    async fn send_outbound_audio(&self, session_id: &str, audio: &[u8]) -> Result<(), MediaError> {
        self.send_message(Message::Binary(encode_frame(
            session_id,
            audio,
            AudioDirection::Outbound,
        )))
        .await
    }
}

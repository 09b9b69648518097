//! Full ASP session flow over a real WebSocket.
//!
//! A raw client drives the server through the complete handshake:
//! capabilities, a downgraded session start, a spoken utterance that
//! runs the whole pipeline, and session teardown with statistics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use voxbridge_asp::{
    parse_frame, session_hash, timestamp_now, AspMessage, AudioConfig, AudioDirection,
    SessionStatus, VadConfig,
};

use voxbridge_agent::config::AgentConfig;
use voxbridge_agent::providers::{
    HealthCheck, LlmProvider, Provider, ProviderConfig, ProviderCore, ProviderError, ProviderPool,
    SttProvider, TtsProvider,
};
use voxbridge_agent::server::AgentServer;

// ── Fixed-answer providers ─────────────────────────────────────────

struct FixedStt(ProviderCore);

#[async_trait]
impl Provider for FixedStt {
    fn core(&self) -> &ProviderCore {
        &self.0
    }
    async fn health_check(&self) -> HealthCheck {
        HealthCheck::healthy(0.1)
    }
}

#[async_trait]
impl SttProvider for FixedStt {
    async fn transcribe(&self, _: &[u8], _: u32) -> Result<Option<String>, ProviderError> {
        Ok(Some("hello agent".to_string()))
    }
}

struct FixedLlm(ProviderCore);

#[async_trait]
impl Provider for FixedLlm {
    fn core(&self) -> &ProviderCore {
        &self.0
    }
    async fn health_check(&self) -> HealthCheck {
        HealthCheck::healthy(0.1)
    }
}

#[async_trait]
impl LlmProvider for FixedLlm {
    async fn generate(&self, _: &str) -> Result<String, ProviderError> {
        Ok("Hello caller.".to_string())
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn generate_stream(&self, _: &str) -> Result<mpsc::Receiver<String>, ProviderError> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let _ = tx.send("Hello caller. ".to_string()).await;
        });
        Ok(rx)
    }
}

struct FixedTts(ProviderCore);

#[async_trait]
impl Provider for FixedTts {
    fn core(&self) -> &ProviderCore {
        &self.0
    }
    async fn health_check(&self) -> HealthCheck {
        HealthCheck::healthy(0.1)
    }
}

#[async_trait]
impl TtsProvider for FixedTts {
    async fn synthesize(&self, _: &str) -> Result<Vec<u8>, ProviderError> {
        Ok(vec![0u8; 1_280])
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn synthesize_stream(&self, _: &str) -> Result<mpsc::Receiver<Vec<u8>>, ProviderError> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let _ = tx.send(vec![0u8; 640]).await;
            let _ = tx.send(vec![0u8; 640]).await;
        });
        Ok(rx)
    }
}

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_server() -> (String, Arc<AgentServer>) {
    let pool = ProviderPool::new(
        Arc::new(FixedStt(ProviderCore::new("stt", ProviderConfig::default()))),
        Arc::new(FixedLlm(ProviderCore::new("llm", ProviderConfig::default()))),
        Arc::new(FixedTts(ProviderCore::new("tts", ProviderConfig::default()))),
    );

    let server = AgentServer::new(AgentConfig::default(), pool);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let serve = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serve.serve(listener).await;
    });

    (url, server)
}

async fn next_message(ws: &mut WsClient) -> Message {
    tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for a message")
        .expect("connection closed")
        .expect("websocket error")
}

async fn next_control(ws: &mut WsClient) -> AspMessage {
    loop {
        if let Message::Text(text) = next_message(ws).await {
            return AspMessage::parse(&text).expect("unparseable control message");
        }
    }
}

/// A 640-byte frame (20 ms at 16 kHz) of loud or silent PCM.
fn frame(loud: bool) -> Vec<u8> {
    let mut data = Vec::with_capacity(640);
    for i in 0..320 {
        let sample: i16 = if loud {
            if i % 2 == 0 { 8_000 } else { -8_000 }
        } else {
            0
        };
        data.extend_from_slice(&sample.to_le_bytes());
    }
    data
}

fn inbound_frame(session_id: &str, loud: bool) -> Message {
    Message::Binary(voxbridge_asp::encode_frame(
        session_id,
        &frame(loud),
        AudioDirection::Inbound,
    ))
}

#[tokio::test]
async fn full_session_flow() {
    let (url, server) = start_server().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    // 1. The server greets with exactly one capabilities message.
    let greeting = next_control(&mut ws).await;
    let AspMessage::ProtocolCapabilities { capabilities, .. } = greeting else {
        panic!("expected capabilities, got {}", greeting.type_name());
    };
    assert!(capabilities.supported_sample_rates.contains(&16_000));

    // 2. Request 24 kHz against an 8/16 kHz server: the session comes
    // up downgraded, with the change recorded.
    let session_id = uuid::Uuid::new_v4().to_string();
    let start = AspMessage::SessionStart {
        session_id: session_id.clone(),
        call_id: Some("PJSIP/1004-0001".to_string()),
        audio: Some(AudioConfig {
            sample_rate: 24_000,
            ..AudioConfig::default()
        }),
        vad: Some(VadConfig::default()),
        metadata: None,
        timestamp: timestamp_now(),
    };
    ws.send(Message::Text(start.to_json())).await.unwrap();

    let started = next_control(&mut ws).await;
    let AspMessage::SessionStarted {
        status, negotiated, ..
    } = started
    else {
        panic!("expected session.started");
    };
    assert_eq!(status, SessionStatus::AcceptedWithChanges);
    let negotiated = negotiated.unwrap();
    assert_eq!(negotiated.audio.sample_rate, 16_000);
    assert_eq!(negotiated.adjustments.len(), 1);
    assert_eq!(negotiated.adjustments[0].field, "audio.sample_rate");
    assert_eq!(server.sessions().count(), 1);

    // 3. Speak: 400 ms of loud audio, then silence until the internal
    // VAD closes the utterance and the pipeline answers.
    for _ in 0..20 {
        ws.send(inbound_frame(&session_id, true)).await.unwrap();
    }
    for _ in 0..40 {
        ws.send(inbound_frame(&session_id, false)).await.unwrap();
    }

    let mut saw_transcript = false;
    let mut saw_response_start = false;
    let mut outbound_frames = 0;
    loop {
        match next_message(&mut ws).await {
            Message::Text(text) => match AspMessage::parse(&text).unwrap() {
                AspMessage::TextUtterance { text, .. } => {
                    assert_eq!(text, "hello agent");
                    saw_transcript = true;
                }
                AspMessage::ResponseStart { .. } => saw_response_start = true,
                AspMessage::ResponseEnd { interrupted, .. } => {
                    assert!(!interrupted);
                    break;
                }
                other => panic!("unexpected message: {}", other.type_name()),
            },
            Message::Binary(data) => {
                let frame = parse_frame(&data).unwrap();
                assert_eq!(frame.direction, AudioDirection::Outbound);
                assert_eq!(frame.session_hash, session_hash(&session_id));
                outbound_frames += 1;
            }
            _ => {}
        }
    }
    assert!(saw_transcript);
    assert!(saw_response_start);
    assert_eq!(outbound_frames, 2);

    // 4. Tear down; the statistics reflect the conversation.
    let end = AspMessage::SessionEnd {
        session_id: session_id.clone(),
        reason: Some("hangup".to_string()),
        timestamp: timestamp_now(),
    };
    ws.send(Message::Text(end.to_json())).await.unwrap();

    let ended = next_control(&mut ws).await;
    let AspMessage::SessionEnded { statistics, .. } = ended else {
        panic!("expected session.ended");
    };
    let stats = statistics.unwrap();
    assert_eq!(stats.audio_frames_received, 60);
    assert_eq!(stats.audio_frames_sent, 2);
    assert_eq!(stats.utterances_transcribed, 1);
    assert_eq!(server.sessions().count(), 0);
}

#[tokio::test]
async fn unknown_message_type_is_answered_with_protocol_error() {
    let (url, _server) = start_server().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    let _ = next_control(&mut ws).await; // capabilities

    ws.send(Message::Text(
        r#"{"type":"session.resume","session_id":"s1"}"#.to_string(),
    ))
    .await
    .unwrap();

    let answer = next_control(&mut ws).await;
    let AspMessage::ProtocolErrorMsg { error, .. } = answer else {
        panic!("expected protocol.error");
    };
    assert_eq!(error.code, 1001);
}

#[tokio::test]
async fn duplicate_session_start_does_not_disturb_the_first() {
    let (url, server) = start_server().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    let _ = next_control(&mut ws).await; // capabilities

    let start = AspMessage::SessionStart {
        session_id: "dup-1".to_string(),
        call_id: None,
        audio: None,
        vad: None,
        metadata: None,
        timestamp: timestamp_now(),
    };
    ws.send(Message::Text(start.to_json())).await.unwrap();
    let first = next_control(&mut ws).await;
    assert!(matches!(first, AspMessage::SessionStarted { .. }));

    let again = AspMessage::SessionStart {
        session_id: "dup-1".to_string(),
        call_id: None,
        audio: None,
        vad: None,
        metadata: None,
        timestamp: timestamp_now(),
    };
    ws.send(Message::Text(again.to_json())).await.unwrap();

    let answer = next_control(&mut ws).await;
    let AspMessage::ProtocolErrorMsg { error, .. } = answer else {
        panic!("expected protocol.error");
    };
    assert_eq!(error.code, 4002);
    assert_eq!(server.sessions().count(), 1);
}

#[tokio::test]
async fn messages_for_unknown_sessions_do_not_alter_state() {
    let (url, server) = start_server().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    let _ = next_control(&mut ws).await; // capabilities

    let end = AspMessage::SessionEnd {
        session_id: "ghost".to_string(),
        reason: None,
        timestamp: timestamp_now(),
    };
    ws.send(Message::Text(end.to_json())).await.unwrap();

    let answer = next_control(&mut ws).await;
    let AspMessage::ProtocolErrorMsg { error, .. } = answer else {
        panic!("expected protocol.error");
    };
    assert_eq!(error.code, 4001);
    assert_eq!(server.sessions().count(), 0);
}

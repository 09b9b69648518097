//! Client handshake behavior against scripted ASP servers.
//!
//! Exercises the capabilities wait with legacy fallback, the normal
//! negotiated session start, and reconnection after a transport drop.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use voxbridge_asp::{
    timestamp_now, AspMessage, AudioConfig, Capabilities, Negotiator, VadConfig,
};
use voxbridge_media::ports::AudioDestination;
use voxbridge_media::ws_client::{ClientEvent, WsDestination, WsDestinationConfig};

/// Scripted ASP server: optionally greets with capabilities, answers
/// every `session.start` with a real negotiation result.
async fn scripted_server(listener: TcpListener, send_caps: bool, drop_first: bool) {
    let mut first = true;
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let close_now = drop_first && first;
        first = false;

        tokio::spawn(async move {
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                return;
            };
            if close_now {
                return; // simulate a transport drop right after accept
            }

            if send_caps {
                let caps = AspMessage::capabilities(Capabilities::default(), None);
                if ws.send(Message::Text(caps.to_json())).await.is_err() {
                    return;
                }
            }

            let negotiator = Negotiator::new(Capabilities::default());
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    if let Ok(AspMessage::SessionStart {
                        session_id,
                        audio,
                        vad,
                        ..
                    }) = AspMessage::parse(&text)
                    {
                        let result = negotiator.negotiate(audio.as_ref(), vad.as_ref());
                        let reply = AspMessage::SessionStarted {
                            session_id,
                            status: result.status,
                            negotiated: result.negotiated,
                            errors: None,
                            timestamp: timestamp_now(),
                        };
                        if ws.send(Message::Text(reply.to_json())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

fn client_config(url: String) -> WsDestinationConfig {
    WsDestinationConfig {
        name: "agent".to_string(),
        url,
        audio: AudioConfig::default(),
        vad: VadConfig::default(),
        caps_timeout: Duration::from_millis(200),
        session_start_timeout: Duration::from_secs(2),
        reconnect_interval: Duration::from_millis(50),
        max_reconnect_attempts: 10,
    }
}

async fn wait_for_connected(events: &mut mpsc::Receiver<ClientEvent>) -> bool {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for connection")
            .expect("event stream closed");
        if let ClientEvent::Connected { legacy } = event {
            return legacy;
        }
    }
}

#[tokio::test]
async fn missing_capabilities_fall_back_to_legacy_mode() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(scripted_server(listener, false, false));

    let (dest, mut events) = WsDestination::spawn(client_config(url));

    // The server never announces capabilities: legacy mode.
    let legacy = wait_for_connected(&mut events).await;
    assert!(legacy);
    assert!(dest.is_connected());

    // A legacy session still starts; the client's defaults apply.
    dest.start_session("session-legacy", "call-1").await.unwrap();

    dest.shutdown();
}

#[tokio::test]
async fn negotiated_session_start_succeeds() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(scripted_server(listener, true, false));

    let mut config = client_config(url);
    // Ask for a rate the server does not support: the session must
    // still come up, downgraded by the server.
    config.audio.sample_rate = 24_000;
    let (dest, mut events) = WsDestination::spawn(config);

    let legacy = wait_for_connected(&mut events).await;
    assert!(!legacy);

    dest.start_session("session-neg", "call-1").await.unwrap();
    dest.end_session("session-neg", "hangup").await.unwrap();

    dest.shutdown();
}

#[tokio::test]
async fn transport_drop_triggers_reconnection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(scripted_server(listener, true, true));

    let (dest, mut events) = WsDestination::spawn(client_config(url));

    // First connection dies immediately; the client must come back on
    // its own and complete a full handshake the second time.
    let mut saw_disconnect = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for reconnect")
            .expect("event stream closed");
        match event {
            ClientEvent::Disconnected => saw_disconnect = true,
            ClientEvent::Connected { legacy: false } if saw_disconnect => break,
            _ => {}
        }
    }

    assert!(dest.is_connected());
    dest.shutdown();
}

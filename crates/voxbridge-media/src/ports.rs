//! Ports toward the AI services.
//!
//! The fork core talks to downstream services only through
//! [`AudioDestination`], so the consumer and manager stay testable
//! without a live WebSocket on the other end.

use async_trait::async_trait;

use crate::error::MediaError;

/// An ASP destination that accepts session lifecycle and audio.
///
/// Two implementations ship: the conversational-agent client and the
/// transcription client (both over [`crate::ws_client::WsDestination`]).
/// `send_audio` carries caller audio; `send_outbound_audio` carries the
/// agent's synthesized audio (transcription destination only).
#[async_trait]
pub trait AudioDestination: Send + Sync {
    /// Short name for logs ("agent", "transcribe").
    fn name(&self) -> &str;

    /// Whether the transport is currently usable.
    ///
    /// Must be cheap: the fork consumer polls this every iteration.
    fn is_connected(&self) -> bool;

    /// Open an ASP session for a call.
    async fn start_session(&self, session_id: &str, call_id: &str) -> Result<(), MediaError>;

    /// Close the ASP session (fire-and-forget on the wire).
    async fn end_session(&self, session_id: &str, reason: &str) -> Result<(), MediaError>;

    /// Send one frame of caller audio.
    async fn send_audio(&self, session_id: &str, audio: &[u8]) -> Result<(), MediaError>;

    /// Signal end-of-speech for the caller (external VAD mode).
    async fn send_speech_end(&self, session_id: &str) -> Result<(), MediaError>;

    /// Send one frame of agent audio (agent→caller direction).
    async fn send_outbound_audio(&self, session_id: &str, audio: &[u8]) -> Result<(), MediaError>;
}

//! Transcription service error types.

/// Failures on the transcription service's async paths.
#[derive(Debug, thiserror::Error)]
pub enum TranscribeError {
    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error(transparent)]
    Protocol(#[from] voxbridge_asp::AspError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

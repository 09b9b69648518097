//! Media server error types.

/// Errors surfaced by the media server's non-real-time paths.
///
/// The media region itself (the RTP callback) has exactly one policy:
/// never raise — log and drop. These errors therefore only appear on
/// the async side (session lifecycle, transports, channel control).
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The ASP destination is not connected.
    #[error("destination '{0}' is not connected")]
    NotConnected(String),

    /// The destination rejected or failed a send.
    #[error("send to '{destination}' failed: {reason}")]
    SendFailed {
        destination: String,
        reason: String,
    },

    /// Session negotiation was rejected by the server.
    #[error("session {0} rejected by server")]
    SessionRejected(String),

    /// A blocking wait exceeded its timeout.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Fork session bookkeeping failure.
    #[error("unknown fork session: {0}")]
    UnknownSession(String),

    /// WebSocket transport failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Protocol-level failure from the shared ASP library.
    #[error(transparent)]
    Protocol(#[from] voxbridge_asp::AspError),

    /// AMI login or action failure.
    #[error("AMI error: {0}")]
    Ami(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error (AMI TCP transport).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

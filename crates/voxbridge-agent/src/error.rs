//! Agent service error types.

use crate::providers::ProviderError;

/// Failures on the agent's session and transport paths.
///
/// Provider internals never propagate their own errors past the
/// provider base; what reaches this level is either a transport
/// problem or an explicit [`ProviderError::Unavailable`], which the
/// pipeline treats as a per-turn error and falls back.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("duplicate session id: {0}")]
    DuplicateSession(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Protocol(#[from] voxbridge_asp::AspError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

//! Protocol error types.
//!
//! [`ProtocolError`] is the wire-level error object carried inside
//! `protocol.error` and `session.started` messages. [`AspError`] is the
//! library-level failure type returned by parsers and the negotiator.

use serde::{Deserialize, Serialize};

/// Category of a wire-level protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Malformed or unknown control message.
    Protocol,

    /// Unsupported or invalid audio configuration.
    Audio,

    /// Invalid VAD configuration.
    Vad,

    /// Unknown, duplicate or otherwise invalid session reference.
    Session,
}

/// Wire-level error object.
///
/// Codes are grouped by category: 1000-range for protocol errors,
/// 2000-range for audio, 3000-range for VAD, 4000-range for session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: u32,
    pub category: ErrorCategory,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    pub recoverable: bool,
}

impl ProtocolError {
    /// Unknown or malformed control message (1000-range).
    pub fn protocol(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            category: ErrorCategory::Protocol,
            message: message.into(),
            details: None,
            recoverable: true,
        }
    }

    /// Unsupported audio parameter (2000-range).
    pub fn audio(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            category: ErrorCategory::Audio,
            message: message.into(),
            details: None,
            recoverable: true,
        }
    }

    /// Invalid session reference (4000-range).
    pub fn session(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            category: ErrorCategory::Session,
            message: message.into(),
            details: None,
            recoverable: true,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Library-level failures raised by the protocol crate.
#[derive(Debug, thiserror::Error)]
pub enum AspError {
    /// Payload was not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The `type` field named a message outside the closed set.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// A required field was missing or had the wrong shape.
    #[error("malformed {message_type} message: {reason}")]
    Malformed {
        message_type: String,
        reason: String,
    },

    /// Binary frame shorter than the fixed header.
    #[error("audio frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// Binary frame did not start with the audio magic byte.
    #[error("bad audio frame magic: {0:#04x}")]
    BadMagic(u8),

    /// Binary frame direction byte was neither inbound nor outbound.
    #[error("bad audio frame direction: {0:#04x}")]
    BadDirection(u8),

    /// Frame referenced a session hash with no registered session.
    #[error("unknown session hash: {0}")]
    UnknownSessionHash(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_serializes_category_lowercase() {
        let err = ProtocolError::protocol(1001, "unknown message type");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["category"], "protocol");
        assert_eq!(json["code"], 1001);
        assert_eq!(json["recoverable"], true);
        assert!(json.get("details").is_none());
    }

    #[test]
    fn protocol_error_round_trips() {
        let err = ProtocolError::audio(2001, "sample rate not supported")
            .with_details(serde_json::json!({"requested": 44_100}));
        let json = serde_json::to_string(&err).unwrap();
        let back: ProtocolError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}

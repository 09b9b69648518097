//! Control message model.
//!
//! One JSON object per WebSocket text frame, discriminated by the
//! `type` field. The set of types is closed: anything else must be
//! answered with a `protocol.error` (category `protocol`, 1000-range
//! code) and must not alter receiver state.

use serde::{Deserialize, Serialize};

use crate::config::{
    AudioConfig, Capabilities, NegotiatedConfig, SessionStatistics, VadConfig,
};
use crate::error::{AspError, ProtocolError};

/// Protocol version spoken by this library.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// All message types in the closed set, in wire form.
const KNOWN_TYPES: [&str; 15] = [
    "protocol.capabilities",
    "session.start",
    "session.started",
    "session.update",
    "session.updated",
    "session.end",
    "session.ended",
    "protocol.error",
    "audio.speech_start",
    "audio.speech_end",
    "response.start",
    "response.end",
    "response.interrupted",
    "call.action",
    "text.utterance",
];

/// Current UTC time as an ISO-8601 string with millisecond precision.
///
/// Wall-clock time appears only in message timestamps; every interval
/// and budget in the services uses the monotonic clock.
#[must_use]
pub fn timestamp_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Outcome of a session negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Accepted,
    AcceptedWithChanges,
    Rejected,
}

impl SessionStatus {
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted | Self::AcceptedWithChanges)
    }
}

/// Channel-control action requested by the conversational service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallAction {
    Transfer,
    Hangup,
}

/// Which side of the call produced a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Caller,
    Agent,
}

/// A control message on the ASP WebSocket.
///
/// Field-level rules worth calling out:
/// * every message carries an ISO-8601 UTC `timestamp`;
/// * `session.update` may carry only VAD changes — the audio format is
///   immutable for the life of a session and [`AspMessage::parse`]
///   rejects an update that tries to change it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AspMessage {
    #[serde(rename = "protocol.capabilities")]
    ProtocolCapabilities {
        version: String,
        capabilities: Capabilities,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
        timestamp: String,
    },

    #[serde(rename = "session.start")]
    SessionStart {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<AudioConfig>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vad: Option<VadConfig>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        timestamp: String,
    },

    #[serde(rename = "session.started")]
    SessionStarted {
        session_id: String,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        negotiated: Option<NegotiatedConfig>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        errors: Option<Vec<ProtocolError>>,
        timestamp: String,
    },

    #[serde(rename = "session.update")]
    SessionUpdate {
        session_id: String,
        vad: VadConfig,
        timestamp: String,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        session_id: String,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        negotiated: Option<NegotiatedConfig>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        errors: Option<Vec<ProtocolError>>,
        timestamp: String,
    },

    #[serde(rename = "session.end")]
    SessionEnd {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: String,
    },

    #[serde(rename = "session.ended")]
    SessionEnded {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        statistics: Option<SessionStatistics>,
        timestamp: String,
    },

    #[serde(rename = "protocol.error")]
    ProtocolErrorMsg {
        error: ProtocolError,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        timestamp: String,
    },

    #[serde(rename = "audio.speech_start")]
    SpeechStart {
        session_id: String,
        timestamp: String,
    },

    #[serde(rename = "audio.speech_end")]
    SpeechEnd {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        timestamp: String,
    },

    #[serde(rename = "response.start")]
    ResponseStart {
        session_id: String,
        response_id: String,
        timestamp: String,
    },

    #[serde(rename = "response.end")]
    ResponseEnd {
        session_id: String,
        response_id: String,
        #[serde(default)]
        interrupted: bool,
        timestamp: String,
    },

    #[serde(rename = "response.interrupted")]
    ResponseInterrupted {
        session_id: String,
        response_id: String,
        timestamp: String,
    },

    #[serde(rename = "call.action")]
    CallActionMsg {
        session_id: String,
        action: CallAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: String,
    },

    #[serde(rename = "text.utterance")]
    TextUtterance {
        session_id: String,
        speaker: Speaker,
        text: String,
        timestamp: String,
    },
}

impl AspMessage {
    /// Parse a control message from a text frame.
    ///
    /// Types outside the closed set yield [`AspError::UnknownType`];
    /// a `session.update` carrying an `audio` object is rejected as
    /// malformed (the audio format is immutable mid-session).
    pub fn parse(text: &str) -> Result<Self, AspError> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        let msg_type = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| AspError::Malformed {
                message_type: "<none>".to_string(),
                reason: "missing type field".to_string(),
            })?;

        if !KNOWN_TYPES.contains(&msg_type) {
            return Err(AspError::UnknownType(msg_type.to_string()));
        }

        if msg_type == "session.update" && value.get("audio").is_some() {
            return Err(AspError::Malformed {
                message_type: msg_type.to_string(),
                reason: "audio configuration cannot change mid-session".to_string(),
            });
        }

        let msg_type = msg_type.to_string();
        serde_json::from_value(value).map_err(|e| AspError::Malformed {
            message_type: msg_type,
            reason: e.to_string(),
        })
    }

    /// Serialize to a single-line JSON text frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        // The enum has no non-serializable states; failure here would
        // be a serde derive bug, so fall back to an empty object.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Wire name of the message type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::ProtocolCapabilities { .. } => "protocol.capabilities",
            Self::SessionStart { .. } => "session.start",
            Self::SessionStarted { .. } => "session.started",
            Self::SessionUpdate { .. } => "session.update",
            Self::SessionUpdated { .. } => "session.updated",
            Self::SessionEnd { .. } => "session.end",
            Self::SessionEnded { .. } => "session.ended",
            Self::ProtocolErrorMsg { .. } => "protocol.error",
            Self::SpeechStart { .. } => "audio.speech_start",
            Self::SpeechEnd { .. } => "audio.speech_end",
            Self::ResponseStart { .. } => "response.start",
            Self::ResponseEnd { .. } => "response.end",
            Self::ResponseInterrupted { .. } => "response.interrupted",
            Self::CallActionMsg { .. } => "call.action",
            Self::TextUtterance { .. } => "text.utterance",
        }
    }

    /// Session the message refers to, when it refers to one.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::ProtocolCapabilities { .. } => None,
            Self::ProtocolErrorMsg { session_id, .. } => session_id.as_deref(),
            Self::SessionStart { session_id, .. }
            | Self::SessionStarted { session_id, .. }
            | Self::SessionUpdate { session_id, .. }
            | Self::SessionUpdated { session_id, .. }
            | Self::SessionEnd { session_id, .. }
            | Self::SessionEnded { session_id, .. }
            | Self::SpeechStart { session_id, .. }
            | Self::SpeechEnd { session_id, .. }
            | Self::ResponseStart { session_id, .. }
            | Self::ResponseEnd { session_id, .. }
            | Self::ResponseInterrupted { session_id, .. }
            | Self::CallActionMsg { session_id, .. }
            | Self::TextUtterance { session_id, .. } => Some(session_id),
        }
    }

    /// Build the capabilities announcement a server sends on connect.
    #[must_use]
    pub fn capabilities(capabilities: Capabilities, server_id: Option<String>) -> Self {
        Self::ProtocolCapabilities {
            version: capabilities.version.clone(),
            capabilities,
            server_id,
            timestamp: timestamp_now(),
        }
    }

    /// Build a `protocol.error` answer.
    #[must_use]
    pub fn error(error: ProtocolError, session_id: Option<String>) -> Self {
        Self::ProtocolErrorMsg {
            error,
            session_id,
            timestamp: timestamp_now(),
        }
    }
}

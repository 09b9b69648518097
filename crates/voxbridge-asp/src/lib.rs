//! Audio Session Protocol (ASP).
//!
//! The wire protocol shared by every voxbridge service. One WebSocket
//! carries two concurrent encodings:
//!
//! * **Control** — one JSON message per text frame, a closed set of
//!   typed messages ([`AspMessage`]).
//! * **Audio** — binary frames with a fixed 12-byte header followed by
//!   raw PCM ([`framing`]).
//!
//! A server advertises its [`Capabilities`] immediately after the
//! transport opens; the client's requested [`AudioConfig`]/[`VadConfig`]
//! are then matched and clamped by the [`Negotiator`], producing a
//! [`NegotiatedConfig`] with a transparent list of [`Adjustment`]s.

pub mod config;
pub mod error;
pub mod framing;
pub mod messages;
pub mod negotiation;

pub use config::{
    Adjustment, AudioConfig, AudioEncoding, Capabilities, NegotiatedConfig, SessionStatistics,
    VadConfig, VAD_MIN_SPEECH_RANGE, VAD_PREFIX_PADDING_RANGE, VAD_RING_BUFFER_RANGE,
    VAD_SILENCE_THRESHOLD_RANGE, VAD_SPEECH_RATIO_RANGE, VAD_THRESHOLD_RANGE,
};
pub use error::{AspError, ErrorCategory, ProtocolError};
pub use framing::{
    encode_frame, is_audio_frame, parse_frame, session_hash, AudioDirection, AudioFrameRef,
    SessionHashRegistry, AUDIO_HEADER_LEN, AUDIO_MAGIC,
};
pub use messages::{timestamp_now, AspMessage, CallAction, SessionStatus, Speaker, PROTOCOL_VERSION};
pub use negotiation::{NegotiationResult, Negotiator};

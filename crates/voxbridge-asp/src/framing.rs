//! Binary audio framing.
//!
//! Audio shares the WebSocket with control JSON as binary frames:
//!
//! ```text
//! [0]      magic 0x01
//! [1]      direction: 0x00 inbound (caller→agent), 0x01 outbound
//! [2..10]  session hash (first 8 bytes of MD5 over the UUID string)
//! [10..12] reserved (zero)
//! [12..]   PCM payload, format per the session's negotiated config
//! ```
//!
//! The hash is a lookup key, never an identity proof. Receivers keep a
//! [`SessionHashRegistry`] populated on session start; a frame whose
//! hash is unknown is dropped, not fatal. On the (practically
//! non-occurring) collision, the first-registered session wins and the
//! frame is still delivered to exactly one session.

use std::collections::HashMap;

use md5::{Digest, Md5};
use parking_lot::RwLock;

use crate::error::AspError;

/// Magic byte opening every audio frame.
pub const AUDIO_MAGIC: u8 = 0x01;

/// Fixed header length in bytes.
pub const AUDIO_HEADER_LEN: usize = 12;

/// Direction of an audio frame relative to the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDirection {
    /// Caller → agent.
    Inbound,

    /// Agent → caller.
    Outbound,
}

impl AudioDirection {
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Inbound => 0x00,
            Self::Outbound => 0x01,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, AspError> {
        match byte {
            0x00 => Ok(Self::Inbound),
            0x01 => Ok(Self::Outbound),
            other => Err(AspError::BadDirection(other)),
        }
    }
}

/// First 8 bytes of the MD5 digest of the session id string.
#[must_use]
pub fn session_hash(session_id: &str) -> [u8; 8] {
    let digest = Md5::digest(session_id.as_bytes());
    let mut hash = [0u8; 8];
    hash.copy_from_slice(&digest[..8]);
    hash
}

/// A parsed audio frame borrowing its payload from the wire buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFrameRef<'a> {
    pub direction: AudioDirection,
    pub session_hash: [u8; 8],
    pub payload: &'a [u8],
}

impl AudioFrameRef<'_> {
    /// Hex form of the session hash, as used for registry lookups.
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex_string(&self.session_hash)
    }
}

/// Serialize an audio frame: header + payload copy.
#[must_use]
pub fn encode_frame(session_id: &str, payload: &[u8], direction: AudioDirection) -> Vec<u8> {
    let mut frame = Vec::with_capacity(AUDIO_HEADER_LEN + payload.len());
    frame.push(AUDIO_MAGIC);
    frame.push(direction.as_byte());
    frame.extend_from_slice(&session_hash(session_id));
    frame.extend_from_slice(&[0u8, 0u8]);
    frame.extend_from_slice(payload);
    frame
}

/// Parse an audio frame, validating magic, direction and length.
pub fn parse_frame(data: &[u8]) -> Result<AudioFrameRef<'_>, AspError> {
    if data.len() < AUDIO_HEADER_LEN {
        return Err(AspError::FrameTooShort(data.len()));
    }
    if data[0] != AUDIO_MAGIC {
        return Err(AspError::BadMagic(data[0]));
    }

    let direction = AudioDirection::from_byte(data[1])?;
    let mut hash = [0u8; 8];
    hash.copy_from_slice(&data[2..10]);

    Ok(AudioFrameRef {
        direction,
        session_hash: hash,
        payload: &data[AUDIO_HEADER_LEN..],
    })
}

/// Quick check whether a binary payload looks like an audio frame.
#[must_use]
pub fn is_audio_frame(data: &[u8]) -> bool {
    data.len() >= AUDIO_HEADER_LEN && data[0] == AUDIO_MAGIC
}

/// Receiver-side map from the 8-byte wire hash to the full session id.
///
/// Updated only on session start/end under a write lock; frame parsing
/// takes a read view. First registration wins on collision.
#[derive(Debug, Default)]
pub struct SessionHashRegistry {
    map: RwLock<HashMap<[u8; 8], String>>,
}

impl SessionHashRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session id under its hash.
    ///
    /// Returns `false` when the hash already maps to a *different*
    /// session (collision) — the existing registration is kept.
    pub fn register(&self, session_id: &str) -> bool {
        let hash = session_hash(session_id);
        let mut map = self.map.write();
        match map.get(&hash) {
            Some(existing) if existing != session_id => {
                tracing::debug!(
                    hash = %hex_string(&hash),
                    existing = %existing,
                    incoming = %session_id,
                    "Session hash collision, keeping first registration"
                );
                false
            }
            _ => {
                map.insert(hash, session_id.to_string());
                true
            }
        }
    }

    /// Remove a session, but only if it owns its hash slot.
    pub fn unregister(&self, session_id: &str) {
        let hash = session_hash(session_id);
        let mut map = self.map.write();
        if map.get(&hash).is_some_and(|owner| owner == session_id) {
            map.remove(&hash);
        }
    }

    /// Resolve a wire hash to the owning session id.
    #[must_use]
    pub fn resolve(&self, hash: &[u8; 8]) -> Option<String> {
        self.map.read().get(hash).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

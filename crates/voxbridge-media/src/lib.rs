//! Media server core.
//!
//! Sits between the telephony stack and the AI services. The RTP side
//! hands us 20 ms PCM frames on a real-time thread; we fork them into
//! per-session ring buffers, drain those buffers best-effort toward the
//! conversational and transcription services over ASP, and queue the
//! agent's synthesized audio for playback toward the caller.
//!
//! The one invariant everything here bends around: the media path never
//! blocks. [`fork::MediaForkManager::fork_audio`] is the only call the
//! RTP callback makes, and it is synchronous, wait-free and infallible.

pub mod ami;
pub mod asp_client;
pub mod config;
pub mod error;
pub mod fork;
pub mod playback;
pub mod ports;
pub mod ring_buffer;
pub mod server;
pub mod ws_client;

pub use config::MediaConfig;
pub use error::MediaError;
pub use fork::{ForkConsumer, ForkConsumerConfig, MediaForkManager};
pub use ports::AudioDestination;
pub use ring_buffer::{AudioFrame, BufferMetrics, RingBuffer};
pub use server::MediaServer;

//! Conversational AI service.
//!
//! Accepts ASP sessions from the media server, buffers caller audio
//! into utterances, and answers through the STT → LLM → TTS pipeline.
//! Time-to-first-audio is the metric everything optimizes for: the LLM
//! streams sentences into the TTS while later sentences are still being
//! generated, and a per-interaction latency budget tracks where every
//! millisecond went.
//!
//! Providers are shared process-wide, wrapped in retry logic and a
//! circuit breaker so one failing model cannot stall the event loop or
//! take a call down — a failed turn degrades (empty transcript, error
//! phrase, or a silent turn) and the call continues.

pub mod call_actions;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod providers;
pub mod server;
pub mod session;

pub use config::AgentConfig;
pub use error::AgentError;

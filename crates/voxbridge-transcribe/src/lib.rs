//! Transcription and indexing service.
//!
//! The second fork destination: receives both directions of a call
//! over ASP (caller audio as inbound frames, agent audio as outbound
//! frames), accumulates each direction independently, transcribes an
//! utterance when the media server signals end-of-speech, and hands
//! the transcript to a sink. The Elasticsearch indexer and semantic
//! search API live behind the sink port, outside this service's core.

pub mod config;
pub mod error;
pub mod server;
pub mod session;
pub mod sink;
pub mod transcriber;

pub use config::TranscribeConfig;
pub use error::TranscribeError;
pub use server::TranscribeServer;
pub use sink::{LogSink, TranscriptRecord, TranscriptSink};
pub use transcriber::{HttpTranscriber, Transcriber};

//! Transcript sink port.
//!
//! The indexing backend (Elasticsearch, semantic search) sits behind
//! this trait; the service core only produces records.

use async_trait::async_trait;
use serde::Serialize;
use voxbridge_asp::Speaker;

use crate::error::TranscribeError;

/// One indexed utterance.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptRecord {
    pub session_id: String,
    pub call_id: String,
    pub speaker: Speaker,
    pub text: String,

    /// Wall-clock timestamp (ISO-8601 UTC).
    pub timestamp: String,

    /// Length of the source utterance in milliseconds.
    pub audio_duration_ms: f64,
}

/// Destination for finished transcripts.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn index(&self, record: TranscriptRecord) -> Result<(), TranscribeError>;
}

/// Sink that emits records to the structured log.
///
/// Stands in for the bulk indexer in development and tests; the record
/// is serialized exactly as the real indexer would receive it.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl TranscriptSink for LogSink {
    async fn index(&self, record: TranscriptRecord) -> Result<(), TranscribeError> {
        let json = serde_json::to_string(&record)
            .map_err(|e| TranscribeError::Sink(e.to_string()))?;
        tracing::info!(record = %json, "Transcript");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxbridge_asp::timestamp_now;

    #[tokio::test]
    async fn log_sink_accepts_records() {
        let sink = LogSink;
        let record = TranscriptRecord {
            session_id: "s1".to_string(),
            call_id: "call-1".to_string(),
            speaker: Speaker::Caller,
            text: "hello".to_string(),
            timestamp: timestamp_now(),
            audio_duration_ms: 840.0,
        };
        sink.index(record).await.unwrap();
    }
}

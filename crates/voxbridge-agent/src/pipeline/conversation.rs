//! Turn orchestration: utterance → STT → LLM → TTS → events.
//!
//! One call per closed utterance. Degradation rules (a failed turn
//! never takes the call down):
//!
//! * STT failure or empty transcript — the caller is not charged a
//!   turn; nothing is emitted.
//! * LLM failure — the configured error phrase is synthesized instead.
//! * TTS failure — the turn goes out silent, but `response.start` /
//!   `response.end` are still emitted so the caller state machine does
//!   not stall.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::call_actions::{parse_call_action, CallActionRequest};
use crate::pipeline::latency::{stage, LatencyBudget};
use crate::pipeline::sentence::{SentencePipeline, SentencePipelineConfig};
use crate::providers::ProviderPool;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Voice-to-voice latency target (ms).
    pub latency_target_ms: f64,

    /// Spoken when the LLM is unavailable for a turn.
    pub error_phrase: String,

    pub sentence: SentencePipelineConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            latency_target_ms: 1_500.0,
            error_phrase: "I'm sorry, I'm having trouble right now. Could you say that again?"
                .to_string(),
            sentence: SentencePipelineConfig::default(),
        }
    }
}

/// What a running turn emits, in order.
#[derive(Debug)]
pub enum TurnEvent {
    /// Final caller transcript.
    Transcript(String),

    ResponseStarted { response_id: String },

    /// One chunk of synthesized agent audio.
    Audio { chunk: Vec<u8> },

    ResponseEnded {
        response_id: String,
        interrupted: bool,
    },

    /// The model asked for a transfer or hangup.
    CallAction(CallActionRequest),
}

/// Drives the STT → LLM → TTS pipeline for a session's turns.
pub struct ConversationEngine {
    pool: Arc<ProviderPool>,
    config: EngineConfig,
}

impl ConversationEngine {
    #[must_use]
    pub fn new(pool: Arc<ProviderPool>, config: EngineConfig) -> Self {
        Self { pool, config }
    }

    /// Run one turn.
    ///
    /// `speech_ended_at` anchors the latency budget; `cancel` is the
    /// barge-in signal and also cascades into the sentence pipeline's
    /// producer.
    pub async fn run_turn(
        &self,
        session_id: &str,
        utterance: Vec<u8>,
        sample_rate: u32,
        speech_ended_at: Instant,
        cancel: CancellationToken,
        events: mpsc::Sender<TurnEvent>,
    ) {
        let mut budget = LatencyBudget::new(self.config.latency_target_ms);
        budget.start_from(speech_ended_at);

        // STT. A failure here means the caller was not understood at
        // all; stay silent and let them speak again.
        let stt_started = Instant::now();
        let transcript = match self.pool.stt.transcribe(&utterance, sample_rate).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                tracing::debug!(session = %session_id, "No speech in utterance");
                return;
            }
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "STT failed, dropping turn");
                return;
            }
        };
        budget.record_stage(stage::STT, stt_started.elapsed().as_secs_f64() * 1_000.0);

        tracing::info!(session = %session_id, text = %transcript, "Caller said");
        if events
            .send(TurnEvent::Transcript(transcript.clone()))
            .await
            .is_err()
        {
            return;
        }

        let response_id = uuid::Uuid::new_v4().to_string();
        if events
            .send(TurnEvent::ResponseStarted {
                response_id: response_id.clone(),
            })
            .await
            .is_err()
        {
            return;
        }

        // Stream sentences into TTS, forwarding chunks as they land.
        let pipeline = SentencePipeline::new(
            Arc::clone(&self.pool.llm),
            Arc::clone(&self.pool.tts),
            self.config.sentence.clone(),
        );
        let mut handle = pipeline.process(&transcript);
        let mut interrupted = false;

        loop {
            let pair = tokio::select! {
                () = cancel.cancelled() => {
                    interrupted = true;
                    handle.cancel();
                    break;
                }
                pair = handle.next() => pair,
            };
            let Some((_sentence, chunk)) = pair else { break };

            if events.send(TurnEvent::Audio { chunk }).await.is_err() {
                handle.cancel();
                return;
            }
        }

        let response_text = handle.response_text();

        let metrics = handle.metrics();
        budget.record_stage(stage::LLM_TTFT, metrics.first_sentence_latency_ms);
        budget.record_stage(stage::LLM_TOTAL, metrics.total_latency_ms);
        if metrics.audio_chunks_produced > 0 {
            budget.record_stage(
                stage::TTS_TTFB,
                (metrics.first_audio_latency_ms - metrics.first_sentence_latency_ms).max(0.0),
            );
        }

        // No sentences at all means the LLM never answered: speak the
        // error phrase so the caller is not left hanging. A TTS failure
        // on top degrades to a silent turn.
        if metrics.sentences_generated == 0 && !interrupted {
            tracing::warn!(session = %session_id, "LLM produced nothing, using error phrase");
            match self.pool.tts.synthesize(&self.config.error_phrase).await {
                Ok(audio) if !audio.is_empty() => {
                    let _ = events.send(TurnEvent::Audio { chunk: audio }).await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "Error phrase synthesis failed, silent turn");
                }
            }
        }

        let _ = events
            .send(TurnEvent::ResponseEnded {
                response_id,
                interrupted,
            })
            .await;

        // Action markers ride on the response text and are executed
        // only after the spoken part has been emitted.
        if !interrupted {
            let (_, action) = parse_call_action(&response_text);
            if let Some(action) = action {
                tracing::info!(session = %session_id, action = ?action.action, "Call action requested");
                let _ = events.send(TurnEvent::CallAction(action)).await;
            }
        }

        budget.finish();
    }
}

//! Sentence-level LLM → TTS streaming.
//!
//! Time-to-first-audio is minimised by overlapping generation with
//! synthesis: the LLM's token stream is cut into sentences, each
//! complete sentence goes onto a small bounded queue, and the TTS
//! consumes from that queue while the LLM keeps producing. The bounded
//! queue is the backpressure — a slow TTS stalls the LLM instead of
//! buffering unbounded text.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::providers::{LlmProvider, TtsProvider};

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct SentencePipelineConfig {
    /// Bounded sentence queue between LLM and TTS.
    pub queue_size: usize,

    /// Wait for the next sentence before giving up on the stream.
    pub sentence_timeout: Duration,
}

impl Default for SentencePipelineConfig {
    fn default() -> Self {
        Self {
            queue_size: 3,
            sentence_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-invocation counters.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub sentences_generated: u64,
    pub audio_chunks_produced: u64,

    /// Call start to first complete sentence (LLM TTFT proxy).
    pub first_sentence_latency_ms: f64,

    /// Call start to first audio chunk yielded.
    pub first_audio_latency_ms: f64,

    pub total_latency_ms: f64,
}

/// Splits a token stream on `[.!?]+\s*` boundaries.
pub struct SentenceSplitter {
    boundary: Regex,
    buffer: String,
}

impl SentenceSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            boundary: Regex::new(r"[.!?]+\s*").expect("sentence boundary regex is a valid literal"),
            buffer: String::new(),
        }
    }

    /// Feed a token chunk; returns any sentences completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut sentences = Vec::new();
        let mut consumed = 0;
        for m in self.boundary.find_iter(&self.buffer) {
            // A terminator run at the very end of the buffer may still
            // grow ("..." arriving one dot at a time); hold it back
            // until more text or the flush. Trailing whitespace means
            // the run is complete.
            if m.end() == self.buffer.len() && !m.as_str().ends_with(char::is_whitespace) {
                break;
            }
            let sentence = self.buffer[consumed..m.end()].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            consumed = m.end();
        }
        self.buffer.drain(..consumed);
        sentences
    }

    /// Emit whatever remains as the final sentence.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

impl Default for SentenceSplitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one running pipeline invocation.
///
/// Dropping the handle (or calling [`PipelineHandle::cancel`]) cancels
/// the producer and consumer tasks — barge-in is a drop, not an
/// exception.
pub struct PipelineHandle {
    output: mpsc::Receiver<(String, Vec<u8>)>,
    metrics: Arc<Mutex<PipelineMetrics>>,
    sentences: Arc<Mutex<Vec<String>>>,
    cancel: CancellationToken,
}

impl PipelineHandle {
    /// Next (sentence, audio chunk) pair, `None` when the stream ends.
    pub async fn next(&mut self) -> Option<(String, Vec<u8>)> {
        self.output.recv().await
    }

    #[must_use]
    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics.lock().clone()
    }

    /// Full raw response text so far (markers included), for call
    /// logs and action parsing.
    #[must_use]
    pub fn response_text(&self) -> String {
        self.sentences.lock().join(" ")
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// LLM → TTS producer/consumer pipeline.
pub struct SentencePipeline {
    llm: Arc<dyn LlmProvider>,
    tts: Arc<dyn TtsProvider>,
    config: SentencePipelineConfig,
}

impl SentencePipeline {
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        tts: Arc<dyn TtsProvider>,
        config: SentencePipelineConfig,
    ) -> Self {
        Self { llm, tts, config }
    }

    /// Run one interaction; audio pairs arrive on the returned handle.
    ///
    /// When either provider lacks streaming the pipeline degrades to a
    /// single-shot generate + synthesize producing one pair.
    #[must_use]
    pub fn process(&self, user_text: &str) -> PipelineHandle {
        let metrics = Arc::new(Mutex::new(PipelineMetrics::default()));
        let sentences = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::channel::<(String, Vec<u8>)>(32);
        let started = Instant::now();

        if self.llm.supports_streaming() && self.tts.supports_streaming() {
            self.spawn_streaming(user_text, out_tx, &metrics, &sentences, &cancel, started);
        } else {
            self.spawn_single_shot(user_text, out_tx, &metrics, &sentences, &cancel, started);
        }

        PipelineHandle {
            output: out_rx,
            metrics,
            sentences,
            cancel,
        }
    }

    #[allow(clippy::too_many_lines)]
    fn spawn_streaming(
        &self,
        user_text: &str,
        out_tx: mpsc::Sender<(String, Vec<u8>)>,
        metrics: &Arc<Mutex<PipelineMetrics>>,
        sentences: &Arc<Mutex<Vec<String>>>,
        cancel: &CancellationToken,
        started: Instant,
    ) {
        let (sentence_tx, mut sentence_rx) = mpsc::channel::<String>(self.config.queue_size);

        // Producer: LLM tokens → sentences. The queue closing when this
        // task ends (for any reason) is the end-of-stream sentinel.
        let llm = Arc::clone(&self.llm);
        let producer_cancel = cancel.clone();
        let text = user_text.to_string();
        tokio::spawn(async move {
            let mut tokens = match llm.generate_stream(&text).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    tracing::warn!(error = %e, "LLM stream failed to start");
                    return;
                }
            };

            let mut splitter = SentenceSplitter::new();
            loop {
                let token = tokio::select! {
                    () = producer_cancel.cancelled() => return,
                    token = tokens.recv() => token,
                };
                let Some(token) = token else { break };

                for sentence in splitter.push(&token) {
                    if sentence_tx.send(sentence).await.is_err() {
                        return; // consumer gone
                    }
                }
            }

            if let Some(rest) = splitter.flush() {
                let _ = sentence_tx.send(rest).await;
            }
        });

        // Consumer: sentences → audio chunks.
        let tts = Arc::clone(&self.tts);
        let consumer_cancel = cancel.clone();
        let metrics = Arc::clone(metrics);
        let sentences = Arc::clone(sentences);
        let timeout = self.config.sentence_timeout;
        tokio::spawn(async move {
            'sentences: loop {
                let sentence = tokio::select! {
                    () = consumer_cancel.cancelled() => break,
                    sentence = tokio::time::timeout(timeout, sentence_rx.recv()) => {
                        match sentence {
                            Ok(Some(sentence)) => sentence,
                            Ok(None) => break, // sentinel: producer done
                            Err(_) => {
                                tracing::warn!("Timed out waiting for the next sentence");
                                break;
                            }
                        }
                    }
                };

                {
                    let mut m = metrics.lock();
                    m.sentences_generated += 1;
                    if m.sentences_generated == 1 {
                        m.first_sentence_latency_ms =
                            started.elapsed().as_secs_f64() * 1_000.0;
                    }
                }
                sentences.lock().push(sentence.clone());

                // Action markers ride on the text but are never spoken.
                let speakable = crate::call_actions::strip_markers(&sentence);
                if speakable.is_empty() {
                    continue;
                }

                let mut chunks = match tts.synthesize_stream(&speakable).await {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        tracing::warn!(error = %e, sentence = %sentence, "Synthesis failed, skipping sentence");
                        continue;
                    }
                };

                loop {
                    let chunk = tokio::select! {
                        () = consumer_cancel.cancelled() => break 'sentences,
                        chunk = chunks.recv() => chunk,
                    };
                    let Some(chunk) = chunk else { break };
                    if chunk.is_empty() {
                        continue;
                    }

                    {
                        let mut m = metrics.lock();
                        m.audio_chunks_produced += 1;
                        if m.audio_chunks_produced == 1 {
                            m.first_audio_latency_ms =
                                started.elapsed().as_secs_f64() * 1_000.0;
                            tracing::info!(
                                first_audio_ms = format_args!("{:.0}", m.first_audio_latency_ms),
                                "First audio"
                            );
                        }
                    }

                    if out_tx.send((sentence.clone(), chunk)).await.is_err() {
                        break 'sentences; // caller stopped iterating
                    }
                }
            }

            let mut m = metrics.lock();
            m.total_latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
            tracing::info!(
                sentences = m.sentences_generated,
                chunks = m.audio_chunks_produced,
                total_ms = format_args!("{:.0}", m.total_latency_ms),
                "Sentence pipeline finished"
            );
        });
    }

    fn spawn_single_shot(
        &self,
        user_text: &str,
        out_tx: mpsc::Sender<(String, Vec<u8>)>,
        metrics: &Arc<Mutex<PipelineMetrics>>,
        sentences: &Arc<Mutex<Vec<String>>>,
        cancel: &CancellationToken,
        started: Instant,
    ) {
        let llm = Arc::clone(&self.llm);
        let tts = Arc::clone(&self.tts);
        let metrics = Arc::clone(metrics);
        let sentences = Arc::clone(sentences);
        let cancel = cancel.clone();
        let text = user_text.to_string();

        tokio::spawn(async move {
            let run = async {
                let response = match llm.generate(&text).await {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!(error = %e, "LLM generation failed");
                        return;
                    }
                };

                {
                    let mut m = metrics.lock();
                    m.sentences_generated = 1;
                    m.first_sentence_latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
                }
                sentences.lock().push(response.clone());

                let speakable = crate::call_actions::strip_markers(&response);
                if speakable.is_empty() {
                    return;
                }

                let audio = match tts.synthesize(&speakable).await {
                    Ok(audio) => audio,
                    Err(e) => {
                        tracing::warn!(error = %e, "Synthesis failed");
                        return;
                    }
                };

                if !audio.is_empty() {
                    {
                        let mut m = metrics.lock();
                        m.audio_chunks_produced = 1;
                        m.first_audio_latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
                    }
                    let _ = out_tx.send((response, audio)).await;
                }
            };

            tokio::select! {
                () = cancel.cancelled() => {}
                () = run => {}
            }

            metrics.lock().total_latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_cuts_on_terminators() {
        let mut splitter = SentenceSplitter::new();
        let sentences = splitter.push("Hello there. How are you? I am fine");
        assert_eq!(sentences, vec!["Hello there.", "How are you?"]);
        assert_eq!(splitter.flush().as_deref(), Some("I am fine"));
    }

    #[test]
    fn splitter_handles_tokens_arriving_in_pieces() {
        let mut splitter = SentenceSplitter::new();
        assert!(splitter.push("One two").is_empty());
        assert!(splitter.push(" three").is_empty());
        let sentences = splitter.push(". Four");
        assert_eq!(sentences, vec!["One two three."]);
        assert_eq!(splitter.flush().as_deref(), Some("Four"));
    }

    #[test]
    fn splitter_holds_trailing_boundary_for_more_punctuation() {
        let mut splitter = SentenceSplitter::new();
        assert!(splitter.push("Wait..").is_empty());
        let sentences = splitter.push(". Done. ");
        assert_eq!(sentences, vec!["Wait...", "Done."]);
        assert_eq!(splitter.flush(), None);
    }

    #[test]
    fn splitter_flush_on_empty_is_none() {
        let mut splitter = SentenceSplitter::new();
        assert_eq!(splitter.flush(), None);
    }
}

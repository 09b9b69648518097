//! End-to-end pipeline behavior with scripted providers.
//!
//! Covers the streaming LLM→TTS overlap (time-to-first-audio bounds),
//! cancellation cascade on barge-in, and the per-turn degradation
//! rules (STT/LLM/TTS failures).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use voxbridge_agent::pipeline::conversation::{ConversationEngine, EngineConfig, TurnEvent};
use voxbridge_agent::pipeline::sentence::{SentencePipeline, SentencePipelineConfig};
use voxbridge_agent::providers::{
    HealthCheck, LlmProvider, Provider, ProviderConfig, ProviderCore, ProviderError, ProviderPool,
    SttProvider, TtsProvider,
};

// ── Scripted providers ─────────────────────────────────────────────

struct ScriptedStt {
    core: ProviderCore,
    text: Option<&'static str>,
    fail: bool,
}

impl ScriptedStt {
    fn new(text: Option<&'static str>, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            core: ProviderCore::new("stt/scripted", ProviderConfig::default()),
            text,
            fail,
        })
    }
}

#[async_trait]
impl Provider for ScriptedStt {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn health_check(&self) -> HealthCheck {
        HealthCheck::healthy(0.1)
    }
}

#[async_trait]
impl SttProvider for ScriptedStt {
    async fn transcribe(&self, _: &[u8], _: u32) -> Result<Option<String>, ProviderError> {
        if self.fail {
            return Err(ProviderError::ConnectionLost("scripted".to_string()));
        }
        Ok(self.text.map(str::to_string))
    }
}

struct ScriptedLlm {
    core: ProviderCore,
    sentences: Vec<&'static str>,
    token_delay: Duration,
    fail: bool,
    tokens_sent: Arc<AtomicU32>,
}

impl ScriptedLlm {
    fn new(sentences: Vec<&'static str>, token_delay: Duration, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            core: ProviderCore::new("llm/scripted", ProviderConfig::default()),
            sentences,
            token_delay,
            fail,
            tokens_sent: Arc::new(AtomicU32::new(0)),
        })
    }
}

#[async_trait]
impl Provider for ScriptedLlm {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn health_check(&self) -> HealthCheck {
        HealthCheck::healthy(0.1)
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn generate(&self, _: &str) -> Result<String, ProviderError> {
        if self.fail {
            return Err(ProviderError::ConnectionLost("scripted".to_string()));
        }
        Ok(self.sentences.join(" "))
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn generate_stream(&self, _: &str) -> Result<mpsc::Receiver<String>, ProviderError> {
        if self.fail {
            return Err(ProviderError::ConnectionLost("scripted".to_string()));
        }

        let (tx, rx) = mpsc::channel(8);
        let sentences: Vec<String> = self.sentences.iter().map(|s| format!("{s} ")).collect();
        let delay = self.token_delay;
        let counter = Arc::clone(&self.tokens_sent);
        tokio::spawn(async move {
            for sentence in sentences {
                tokio::time::sleep(delay).await;
                counter.fetch_add(1, Ordering::SeqCst);
                if tx.send(sentence).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

struct ScriptedTts {
    core: ProviderCore,
    chunk_delay: Duration,
    chunks_per_sentence: usize,
    fail: bool,
}

impl ScriptedTts {
    fn new(chunk_delay: Duration, chunks_per_sentence: usize, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            core: ProviderCore::new("tts/scripted", ProviderConfig::default()),
            chunk_delay,
            chunks_per_sentence,
            fail,
        })
    }
}

#[async_trait]
impl Provider for ScriptedTts {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn health_check(&self) -> HealthCheck {
        HealthCheck::healthy(0.1)
    }
}

#[async_trait]
impl TtsProvider for ScriptedTts {
    async fn synthesize(&self, _: &str) -> Result<Vec<u8>, ProviderError> {
        if self.fail {
            return Err(ProviderError::ConnectionLost("scripted".to_string()));
        }
        Ok(vec![0u8; 1_600])
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn synthesize_stream(&self, _: &str) -> Result<mpsc::Receiver<Vec<u8>>, ProviderError> {
        if self.fail {
            return Err(ProviderError::ConnectionLost("scripted".to_string()));
        }

        let (tx, rx) = mpsc::channel(8);
        let delay = self.chunk_delay;
        let chunks = self.chunks_per_sentence;
        tokio::spawn(async move {
            for _ in 0..chunks {
                tokio::time::sleep(delay).await;
                if tx.send(vec![0u8; 320]).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

fn pool(
    stt: Arc<ScriptedStt>,
    llm: Arc<ScriptedLlm>,
    tts: Arc<ScriptedTts>,
) -> Arc<ProviderPool> {
    ProviderPool::new(stt, llm, tts)
}

async fn collect_turn_events(
    engine: &ConversationEngine,
    cancel: tokio_util::sync::CancellationToken,
) -> Vec<TurnEvent> {
    let (events_tx, mut events_rx) = mpsc::channel(64);
    engine
        .run_turn(
            "session-1",
            vec![0u8; 3_200],
            8_000,
            Instant::now(),
            cancel,
            events_tx,
        )
        .await;

    let mut events = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        events.push(event);
    }
    events
}

// ── Sentence pipeline ──────────────────────────────────────────────

#[tokio::test]
async fn first_audio_arrives_after_first_sentence_plus_first_chunk() {
    // LLM delivers the first sentence after ~50 ms, TTS the first
    // chunk ~30 ms later: first audio must land between the two
    // bounds (with generous scheduling slack on the upper side).
    let llm = ScriptedLlm::new(
        vec!["First sentence.", "Second sentence."],
        Duration::from_millis(50),
        false,
    );
    let tts = ScriptedTts::new(Duration::from_millis(30), 2, false);

    let pipeline = SentencePipeline::new(llm, tts, SentencePipelineConfig::default());
    let mut handle = pipeline.process("hello");

    let first = handle.next().await;
    assert!(first.is_some());

    let metrics = handle.metrics();
    assert!(
        metrics.first_audio_latency_ms >= 50.0,
        "first audio at {:.0}ms, before the LLM could have produced a sentence",
        metrics.first_audio_latency_ms
    );
    assert!(
        metrics.first_audio_latency_ms <= 500.0,
        "first audio at {:.0}ms, streaming overlap is not working",
        metrics.first_audio_latency_ms
    );
}

#[tokio::test]
async fn every_sentence_is_synthesized_in_order() {
    let llm = ScriptedLlm::new(
        vec!["One.", "Two.", "Three."],
        Duration::from_millis(5),
        false,
    );
    let tts = ScriptedTts::new(Duration::from_millis(2), 2, false);

    let pipeline = SentencePipeline::new(llm, tts, SentencePipelineConfig::default());
    let mut handle = pipeline.process("hello");

    let mut labels = Vec::new();
    while let Some((sentence, chunk)) = handle.next().await {
        assert_eq!(chunk.len(), 320);
        labels.push(sentence);
    }

    assert_eq!(labels.len(), 6); // 3 sentences × 2 chunks
    assert_eq!(labels[0], "One.");
    assert_eq!(labels[5], "Three.");

    let metrics = handle.metrics();
    assert_eq!(metrics.sentences_generated, 3);
    assert_eq!(metrics.audio_chunks_produced, 6);
    assert!(metrics.total_latency_ms > 0.0);
}

#[tokio::test]
async fn dropping_the_handle_stops_the_producer() {
    let llm = ScriptedLlm::new(
        vec!["A.", "B.", "C.", "D.", "E.", "F.", "G.", "H."],
        Duration::from_millis(20),
        false,
    );
    let counter = Arc::clone(&llm.tokens_sent);
    let tts = ScriptedTts::new(Duration::from_millis(5), 1, false);

    let pipeline = SentencePipeline::new(llm, tts, SentencePipelineConfig::default());
    let mut handle = pipeline.process("hello");

    // Take one pair, then stop iterating.
    assert!(handle.next().await.is_some());
    drop(handle);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let at_drop = counter.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The producer observed the cancellation; token production stopped
    // (allow one token already in flight at the instant of the drop).
    let after = counter.load(Ordering::SeqCst);
    assert!(
        after <= at_drop + 1,
        "producer kept generating after cancel: {at_drop} -> {after}"
    );
}

#[tokio::test]
async fn non_streaming_provider_falls_back_to_single_shot() {
    struct BatchTts(ProviderCore);

    #[async_trait]
    impl Provider for BatchTts {
        fn core(&self) -> &ProviderCore {
            &self.0
        }
        async fn health_check(&self) -> HealthCheck {
            HealthCheck::healthy(0.1)
        }
    }

    #[async_trait]
    impl TtsProvider for BatchTts {
        async fn synthesize(&self, _: &str) -> Result<Vec<u8>, ProviderError> {
            Ok(vec![7u8; 640])
        }
        // supports_streaming stays false
    }

    let llm = ScriptedLlm::new(vec!["One.", "Two."], Duration::from_millis(1), false);
    let tts = Arc::new(BatchTts(ProviderCore::new(
        "tts/batch",
        ProviderConfig::default(),
    )));

    let pipeline = SentencePipeline::new(llm, tts, SentencePipelineConfig::default());
    let mut handle = pipeline.process("hello");

    // Exactly one (text, audio) pair.
    let (text, audio) = handle.next().await.unwrap();
    assert_eq!(text, "One. Two.");
    assert_eq!(audio, vec![7u8; 640]);
    assert!(handle.next().await.is_none());
}

// ── Conversation turns ─────────────────────────────────────────────

#[tokio::test]
async fn a_turn_emits_the_full_event_sequence() {
    let engine = ConversationEngine::new(
        pool(
            ScriptedStt::new(Some("what time is it"), false),
            ScriptedLlm::new(vec!["It is noon."], Duration::from_millis(5), false),
            ScriptedTts::new(Duration::from_millis(2), 2, false),
        ),
        EngineConfig::default(),
    );

    let events =
        collect_turn_events(&engine, tokio_util::sync::CancellationToken::new()).await;

    assert!(matches!(&events[0], TurnEvent::Transcript(t) if t == "what time is it"));
    assert!(matches!(&events[1], TurnEvent::ResponseStarted { .. }));
    let audio = events
        .iter()
        .filter(|e| matches!(e, TurnEvent::Audio { .. }))
        .count();
    assert_eq!(audio, 2);
    assert!(matches!(
        events.last().unwrap(),
        TurnEvent::ResponseEnded { interrupted: false, .. }
    ));
}

#[tokio::test]
async fn stt_failure_does_not_charge_a_turn() {
    let engine = ConversationEngine::new(
        pool(
            ScriptedStt::new(None, true),
            ScriptedLlm::new(vec!["Never spoken."], Duration::from_millis(1), false),
            ScriptedTts::new(Duration::from_millis(1), 1, false),
        ),
        EngineConfig::default(),
    );

    let events =
        collect_turn_events(&engine, tokio_util::sync::CancellationToken::new()).await;
    assert!(events.is_empty());
}

#[tokio::test]
async fn llm_failure_speaks_the_error_phrase() {
    let engine = ConversationEngine::new(
        pool(
            ScriptedStt::new(Some("hello"), false),
            ScriptedLlm::new(vec![], Duration::from_millis(1), true),
            ScriptedTts::new(Duration::from_millis(1), 1, false),
        ),
        EngineConfig::default(),
    );

    let events =
        collect_turn_events(&engine, tokio_util::sync::CancellationToken::new()).await;

    // The caller still hears something: response.start, the error
    // phrase audio, response.end.
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::ResponseStarted { .. })));
    assert!(events.iter().any(|e| matches!(e, TurnEvent::Audio { .. })));
    assert!(events.iter().any(
        |e| matches!(e, TurnEvent::ResponseEnded { interrupted: false, .. })
    ));
}

#[tokio::test]
async fn tts_failure_degrades_to_a_silent_turn() {
    let engine = ConversationEngine::new(
        pool(
            ScriptedStt::new(Some("hello"), false),
            ScriptedLlm::new(vec!["Quiet reply."], Duration::from_millis(1), false),
            ScriptedTts::new(Duration::from_millis(1), 1, true),
        ),
        EngineConfig::default(),
    );

    let events =
        collect_turn_events(&engine, tokio_util::sync::CancellationToken::new()).await;

    // No audio, but the turn is still bracketed so the caller state
    // machine does not stall.
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::ResponseStarted { .. })));
    assert!(!events.iter().any(|e| matches!(e, TurnEvent::Audio { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::ResponseEnded { .. })));
}

#[tokio::test]
async fn barge_in_interrupts_the_response_within_bound() {
    let engine = Arc::new(ConversationEngine::new(
        pool(
            ScriptedStt::new(Some("tell me a story"), false),
            ScriptedLlm::new(
                vec!["Once upon a time.", "There was a very long story.", "It went on."],
                Duration::from_millis(30),
                false,
            ),
            ScriptedTts::new(Duration::from_millis(30), 5, false),
        ),
        EngineConfig::default(),
    ));

    let cancel = tokio_util::sync::CancellationToken::new();
    let (events_tx, mut events_rx) = mpsc::channel(64);

    let run_engine = Arc::clone(&engine);
    let run_cancel = cancel.clone();
    let turn = tokio::spawn(async move {
        run_engine
            .run_turn(
                "session-1",
                vec![0u8; 3_200],
                8_000,
                Instant::now(),
                run_cancel,
                events_tx,
            )
            .await;
    });

    // Wait for the first audio, then barge in.
    loop {
        match events_rx.recv().await {
            Some(TurnEvent::Audio { .. }) => break,
            Some(_) => {}
            None => panic!("turn ended before any audio"),
        }
    }
    let barge_at = Instant::now();
    cancel.cancel();

    // The turn must wind down and report the interruption promptly.
    let mut interrupted = false;
    while let Some(event) = events_rx.recv().await {
        if let TurnEvent::ResponseEnded {
            interrupted: was_interrupted,
            ..
        } = event
        {
            interrupted = was_interrupted;
        }
    }
    turn.await.unwrap();

    assert!(interrupted, "barge-in was not reported");
    assert!(
        barge_at.elapsed() < Duration::from_secs(2),
        "turn took {:?} to wind down",
        barge_at.elapsed()
    );
}

#[tokio::test]
async fn action_markers_are_relayed_and_never_spoken() {
    let engine = ConversationEngine::new(
        pool(
            ScriptedStt::new(Some("goodbye"), false),
            ScriptedLlm::new(vec!["Goodbye!", "[hangup]"], Duration::from_millis(2), false),
            ScriptedTts::new(Duration::from_millis(1), 1, false),
        ),
        EngineConfig::default(),
    );

    let events =
        collect_turn_events(&engine, tokio_util::sync::CancellationToken::new()).await;

    // One audio chunk for "Goodbye!", none for the marker sentence.
    let audio = events
        .iter()
        .filter(|e| matches!(e, TurnEvent::Audio { .. }))
        .count();
    assert_eq!(audio, 1);

    let action = events.iter().find_map(|e| match e {
        TurnEvent::CallAction(request) => Some(request.action),
        _ => None,
    });
    assert_eq!(action, Some(voxbridge_asp::CallAction::Hangup));
}

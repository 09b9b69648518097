//! Best-effort fork consumer.
//!
//! One task per session. Drains the session's ring buffer in small
//! batches and hands frames to the primary (conversational) and, when
//! connected, the secondary (transcription) destination. The consumer
//! never pushes back on the producer; its only observable effects are
//! the delivery metrics and the measured lag.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ports::AudioDestination;
use crate::ring_buffer::RingBuffer;

/// Frames drained per loop iteration before yielding.
const BATCH_SIZE: usize = 10;

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ForkConsumerConfig {
    /// Sleep when the buffer was empty.
    pub poll_interval: Duration,

    /// Lag above which a warning is logged per frame.
    pub lag_warn: Duration,

    /// Backoff start when the primary destination is unavailable.
    pub backoff_initial: Duration,

    /// Backoff cap.
    pub backoff_max: Duration,

    /// Backoff growth factor.
    pub backoff_multiplier: f64,

    /// Bound on cooperative shutdown before the task is aborted.
    pub stop_timeout: Duration,
}

impl Default for ForkConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            lag_warn: Duration::from_millis(100),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            stop_timeout: Duration::from_secs(2),
        }
    }
}

/// Lifecycle state of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Delivery counters for one consumer.
#[derive(Debug, Clone, Default)]
pub struct ConsumerMetrics {
    pub frames_sent: u64,
    pub frames_failed: u64,
    pub bytes_sent: u64,
    pub total_lag_ms: f64,
    pub max_lag_ms: f64,
    pub backoff_waits: u64,
    pub last_error: Option<String>,
}

impl ConsumerMetrics {
    #[must_use]
    pub fn avg_lag_ms(&self) -> f64 {
        if self.frames_sent == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.total_lag_ms / self.frames_sent as f64
        }
    }

    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.frames_sent + self.frames_failed;
        if total == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.frames_sent as f64 / total as f64
        }
    }
}

/// Async worker draining one session's ring buffer.
pub struct ForkConsumer {
    session_id: String,
    buffer: Arc<RingBuffer>,
    primary: Arc<dyn AudioDestination>,
    secondary: Option<Arc<dyn AudioDestination>>,
    config: ForkConsumerConfig,
    state: Mutex<ConsumerState>,
    metrics: Mutex<ConsumerMetrics>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ForkConsumer {
    #[must_use]
    pub fn new(
        session_id: String,
        buffer: Arc<RingBuffer>,
        primary: Arc<dyn AudioDestination>,
        secondary: Option<Arc<dyn AudioDestination>>,
        config: ForkConsumerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            buffer,
            primary,
            secondary,
            config,
            state: Mutex::new(ConsumerState::Stopped),
            metrics: Mutex::new(ConsumerMetrics::default()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Spawn the consumer loop.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == ConsumerState::Running || *state == ConsumerState::Starting {
                tracing::warn!(session = %self.session_id, "Fork consumer already running");
                return;
            }
            *state = ConsumerState::Starting;
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run().await;
        });
        *self.task.lock() = Some(handle);

        tracing::info!(session = %self.session_id, "Fork consumer started");
    }

    /// Stop the consumer cooperatively.
    ///
    /// The loop gets `stop_timeout` (default 2 s) to wind down; past
    /// that the task is aborted and a warning logged.
    pub async fn stop(&self) {
        *self.state.lock() = ConsumerState::Stopping;
        self.cancel.cancel();

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.config.stop_timeout, handle)
                .await
                .is_err()
            {
                tracing::warn!(
                    session = %self.session_id,
                    "Fork consumer did not stop within bound, aborting"
                );
                abort.abort();
            }
        }

        *self.state.lock() = ConsumerState::Stopped;

        let metrics = self.metrics();
        tracing::info!(
            session = %self.session_id,
            sent = metrics.frames_sent,
            failed = metrics.frames_failed,
            avg_lag_ms = format_args!("{:.1}", metrics.avg_lag_ms()),
            "Fork consumer stopped"
        );
    }

    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    #[must_use]
    pub fn metrics(&self) -> ConsumerMetrics {
        self.metrics.lock().clone()
    }

    async fn run(&self) {
        *self.state.lock() = ConsumerState::Running;
        let mut backoff = self.config.backoff_initial;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // Primary down: wait with jittered exponential backoff
            // rather than spinning against a dead socket.
            if !self.primary.is_connected() {
                self.metrics.lock().backoff_waits += 1;
                tracing::debug!(
                    session = %self.session_id,
                    backoff_ms = backoff.as_millis(),
                    "Primary destination unavailable, backing off"
                );

                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(jittered(backoff)) => {}
                }

                backoff = next_backoff(backoff, &self.config);
                continue;
            }
            backoff = self.config.backoff_initial;

            let processed = self.drain_batch().await;

            if processed == 0 {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        *self.state.lock() = ConsumerState::Stopped;
        tracing::debug!(session = %self.session_id, "Fork consumer loop finished");
    }

    /// Pop and deliver up to [`BATCH_SIZE`] frames.
    async fn drain_batch(&self) -> usize {
        let mut processed = 0;

        while processed < BATCH_SIZE {
            let Some(frame) = self.buffer.pop() else {
                break;
            };

            // A shared buffer would be a wiring bug; frames from another
            // session are dropped rather than misdelivered.
            if frame.session_id != self.session_id {
                tracing::debug!(
                    session = %self.session_id,
                    frame_session = %frame.session_id,
                    "Skipping frame from foreign session"
                );
                continue;
            }

            let lag = frame.age();
            let lag_ms = lag.as_secs_f64() * 1_000.0;
            if lag > self.config.lag_warn {
                tracing::warn!(
                    session = %self.session_id,
                    lag_ms = format_args!("{lag_ms:.1}"),
                    threshold_ms = self.config.lag_warn.as_millis(),
                    "Consumer lag above threshold"
                );
            }

            // Delivery is defined by the primary; the secondary is
            // best-effort and its failures are silent.
            match self.primary.send_audio(&self.session_id, &frame.data).await {
                Ok(()) => {
                    let mut metrics = self.metrics.lock();
                    metrics.frames_sent += 1;
                    metrics.bytes_sent += frame.data.len() as u64;
                    metrics.total_lag_ms += lag_ms;
                    if lag_ms > metrics.max_lag_ms {
                        metrics.max_lag_ms = lag_ms;
                    }
                }
                Err(e) => {
                    let mut metrics = self.metrics.lock();
                    metrics.frames_failed += 1;
                    metrics.last_error = Some(e.to_string());
                    drop(metrics);
                    tracing::debug!(
                        session = %self.session_id,
                        error = %e,
                        "Frame delivery to primary failed"
                    );
                }
            }

            if let Some(ref secondary) = self.secondary {
                if secondary.is_connected() {
                    if let Err(e) = secondary.send_audio(&self.session_id, &frame.data).await {
                        tracing::debug!(
                            session = %self.session_id,
                            error = %e,
                            "Frame delivery to secondary failed"
                        );
                    }
                }
            }

            processed += 1;
        }

        processed
    }
}

fn next_backoff(current: Duration, config: &ForkConsumerConfig) -> Duration {
    current
        .mul_f64(config.backoff_multiplier)
        .min(config.backoff_max)
}

/// Apply ±25% jitter so reconnecting consumers do not thunder together.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    base.mul_f64(factor)
}

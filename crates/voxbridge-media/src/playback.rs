//! Outbound playback queue.
//!
//! Agent audio arrives in arbitrarily-sized chunks over ASP and leaves
//! toward the caller as fixed 20 ms RTP frames. The queue reassembles
//! chunk boundaries, hands the RTP side one frame per tick, and clears
//! atomically on barge-in so a cancelled response never leaks stale
//! audio.
//!
//! When the queue is empty mid-call the caller would otherwise hear
//! dead air; while the agent is still thinking (session `processing`)
//! a −60 dBFS comfort-noise frame is substituted. Activation is driven
//! purely by session-state transitions relayed from the agent — the
//! audio callback itself never decides.

use std::collections::VecDeque;

use parking_lot::Mutex;
use rand::Rng;

/// What the RTP side should play this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackFrame {
    /// Agent audio.
    Audio(Vec<u8>),

    /// Low-level noise while the agent is thinking.
    ComfortNoise(Vec<u8>),

    /// Nothing queued and nothing to mask.
    Silence,
}

/// Playback-relevant session state, as relayed from the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    /// Caller is speaking or the line is idle.
    #[default]
    Idle,

    /// Utterance sent, agent thinking — mask the gap.
    Processing,

    /// Agent audio is streaming.
    Responding,
}

struct Inner {
    frames: VecDeque<Vec<u8>>,
    partial: Vec<u8>,
    state: PlaybackState,
    frames_played: u64,
    bytes_cleared: u64,
}

/// Per-session outbound audio queue.
pub struct PlaybackQueue {
    inner: Mutex<Inner>,
    frame_bytes: usize,
    comfort_noise: bool,
}

impl PlaybackQueue {
    /// `frame_bytes` is the fixed RTP frame size (e.g. 320 for 20 ms
    /// at 8 kHz/16-bit/mono).
    #[must_use]
    pub fn new(frame_bytes: usize, comfort_noise: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::new(),
                partial: Vec::new(),
                state: PlaybackState::Idle,
                frames_played: 0,
                bytes_cleared: 0,
            }),
            frame_bytes: frame_bytes.max(2),
            comfort_noise,
        }
    }

    /// Queue a chunk of agent audio, slicing it into RTP frames.
    pub fn push(&self, audio: &[u8]) {
        let mut inner = self.inner.lock();
        inner.partial.extend_from_slice(audio);

        while inner.partial.len() >= self.frame_bytes {
            let rest = inner.partial.split_off(self.frame_bytes);
            let frame = std::mem::replace(&mut inner.partial, rest);
            inner.frames.push_back(frame);
        }
    }

    /// Flush any trailing partial frame, zero-padded to full size.
    ///
    /// Called on `response.end` so the tail of an utterance is not
    /// stuck waiting for bytes that will never come.
    pub fn flush_partial(&self) {
        let mut inner = self.inner.lock();
        if inner.partial.is_empty() {
            return;
        }
        let mut frame = std::mem::take(&mut inner.partial);
        frame.resize(self.frame_bytes, 0);
        inner.frames.push_back(frame);
    }

    /// Produce the next frame for the RTP tick.
    #[must_use]
    pub fn next_frame(&self) -> PlaybackFrame {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.pop_front() {
            inner.frames_played += 1;
            return PlaybackFrame::Audio(frame);
        }

        if self.comfort_noise && inner.state == PlaybackState::Processing {
            return PlaybackFrame::ComfortNoise(comfort_noise_frame(self.frame_bytes));
        }

        PlaybackFrame::Silence
    }

    /// Barge-in: drop everything queued, atomically.
    ///
    /// Returns the number of bytes discarded.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let cleared: usize =
            inner.frames.iter().map(Vec::len).sum::<usize>() + inner.partial.len();
        inner.frames.clear();
        inner.partial.clear();
        inner.bytes_cleared += cleared as u64;
        cleared
    }

    /// Relay a session-state transition from the agent.
    pub fn set_state(&self, state: PlaybackState) {
        let mut inner = self.inner.lock();
        if inner.state != state {
            tracing::debug!(old = ?inner.state, new = ?state, "Playback state transition");
            inner.state = state;
        }
    }

    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.inner.lock().state
    }

    /// Bytes currently queued (frames plus partial).
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        let inner = self.inner.lock();
        inner.frames.iter().map(Vec::len).sum::<usize>() + inner.partial.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queued_bytes() == 0
    }
}

/// One frame of −60 dBFS white noise (16-bit LE mono).
fn comfort_noise_frame(frame_bytes: usize) -> Vec<u8> {
    // −60 dBFS on a 16-bit scale is an amplitude of about 33.
    const AMPLITUDE: i16 = 33;

    let mut rng = rand::thread_rng();
    let mut frame = Vec::with_capacity(frame_bytes);
    for _ in 0..frame_bytes / 2 {
        let sample: i16 = rng.gen_range(-AMPLITUDE..=AMPLITUDE);
        frame.extend_from_slice(&sample.to_le_bytes());
    }
    frame
}

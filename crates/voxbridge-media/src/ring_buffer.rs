//! Per-session audio ring buffer.
//!
//! Carries 20 ms PCM frames from the real-time capture thread to the
//! async fork consumer without coupling them. Overflow is not an error:
//! when the buffer is full the *oldest* frame is discarded so the live
//! media path never pauses and lag stays bounded.
//!
//! Realisation: a bounded `VecDeque` whose overwrite-oldest is enforced
//! on push, behind a `parking_lot` mutex. Every critical section is a
//! handful of O(1) operations with no allocation beyond the frame
//! itself, so the producer never waits a measurable amount of time.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use voxbridge_asp::AudioConfig;

/// One captured audio frame with tracking metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Session the frame belongs to.
    pub session_id: String,

    /// Raw PCM payload.
    pub data: Vec<u8>,

    /// Monotonic enqueue time.
    pub enqueued_at: Instant,

    /// Strictly increasing per-buffer sequence number.
    pub sequence: u64,
}

impl AudioFrame {
    /// Time the frame has spent in (or since leaving) the buffer.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Buffer counters, exported as a value snapshot.
#[derive(Debug, Clone, Default)]
pub struct BufferMetrics {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub frames_consumed: u64,
    pub bytes_received: u64,
    pub bytes_dropped: u64,
    pub bytes_consumed: u64,
    pub overflow_events: u64,
    pub last_overflow_at: Option<Instant>,
    pub peak_size_bytes: usize,
}

impl BufferMetrics {
    /// Fraction of received frames that were dropped (0.0–1.0).
    #[must_use]
    pub fn drop_rate(&self) -> f64 {
        if self.frames_received == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.frames_dropped as f64 / self.frames_received as f64
        }
    }
}

struct Inner {
    queue: VecDeque<AudioFrame>,
    size_bytes: usize,
    sequence: u64,
    metrics: BufferMetrics,
}

/// Bounded drop-oldest frame queue (single producer, single consumer).
pub struct RingBuffer {
    inner: Mutex<Inner>,
    capacity_frames: usize,
    capacity_ms: u32,
    bytes_per_ms: u32,
}

impl RingBuffer {
    /// Create a buffer holding `capacity_ms` of audio at `audio`'s
    /// format, assuming the session's negotiated frame duration.
    #[must_use]
    pub fn new(capacity_ms: u32, audio: &AudioConfig) -> Self {
        let capacity_bytes = audio.bytes_per_ms() * capacity_ms;
        let bytes_per_frame = audio.bytes_per_frame().max(1);
        let capacity_frames = (capacity_bytes / bytes_per_frame).max(1) as usize;

        tracing::debug!(
            capacity_ms,
            capacity_frames,
            capacity_bytes,
            "Ring buffer created"
        );

        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity_frames),
                size_bytes: 0,
                sequence: 0,
                metrics: BufferMetrics::default(),
            }),
            capacity_frames,
            capacity_ms,
            bytes_per_ms: audio.bytes_per_ms().max(1),
        }
    }

    /// Push a frame. Never blocks, never fails.
    ///
    /// Returns `true` when the frame was stored without overflow,
    /// `false` when the oldest frame had to be discarded to admit it.
    /// Either way the new frame is in the buffer afterwards.
    pub fn push(&self, session_id: &str, data: Vec<u8>) -> bool {
        let len = data.len();
        let mut inner = self.inner.lock();

        let frame = AudioFrame {
            session_id: session_id.to_string(),
            data,
            enqueued_at: Instant::now(),
            sequence: inner.sequence,
        };
        inner.sequence += 1;

        let overflowed = inner.queue.len() >= self.capacity_frames;
        if overflowed {
            if let Some(old) = inner.queue.pop_front() {
                inner.size_bytes -= old.data.len();
                inner.metrics.frames_dropped += 1;
                inner.metrics.bytes_dropped += old.data.len() as u64;
                inner.metrics.overflow_events += 1;
                inner.metrics.last_overflow_at = Some(Instant::now());
            }
        }

        inner.queue.push_back(frame);
        inner.size_bytes += len;
        inner.metrics.frames_received += 1;
        inner.metrics.bytes_received += len as u64;
        if inner.size_bytes > inner.metrics.peak_size_bytes {
            inner.metrics.peak_size_bytes = inner.size_bytes;
        }

        !overflowed
    }

    /// Remove and return the oldest frame, if any. Never blocks.
    pub fn pop(&self) -> Option<AudioFrame> {
        let mut inner = self.inner.lock();
        let frame = inner.queue.pop_front()?;
        inner.size_bytes -= frame.data.len();
        inner.metrics.frames_consumed += 1;
        inner.metrics.bytes_consumed += frame.data.len() as u64;
        Some(frame)
    }

    /// Copy of the oldest frame without removing it.
    pub fn peek(&self) -> Option<AudioFrame> {
        self.inner.lock().queue.front().cloned()
    }

    /// Discard everything; returns the number of frames dropped.
    ///
    /// Used on fork resume so stale audio is never replayed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.queue.len();
        inner.queue.clear();
        inner.size_bytes = 0;
        count
    }

    /// Frames currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.inner.lock().queue.len() >= self.capacity_frames
    }

    /// Buffered audio in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.inner.lock().size_bytes
    }

    /// Buffered audio in milliseconds.
    #[must_use]
    pub fn size_ms(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        {
            self.size_bytes() as f64 / f64::from(self.bytes_per_ms)
        }
    }

    /// Capacity in frames.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity_frames
    }

    /// Capacity in milliseconds of audio.
    #[must_use]
    pub const fn capacity_ms(&self) -> u32 {
        self.capacity_ms
    }

    /// Occupancy as a fraction of capacity (0.0–1.0).
    #[must_use]
    pub fn fill_ratio(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        {
            self.len() as f64 / self.capacity_frames as f64
        }
    }

    /// Age of the oldest buffered frame, or zero when empty.
    #[must_use]
    pub fn oldest_age(&self) -> Duration {
        self.inner
            .lock()
            .queue
            .front()
            .map_or(Duration::ZERO, AudioFrame::age)
    }

    /// Value snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> BufferMetrics {
        self.inner.lock().metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(capacity_ms: u32) -> RingBuffer {
        RingBuffer::new(capacity_ms, &AudioConfig::default())
    }

    fn frame_bytes(label: u8) -> Vec<u8> {
        vec![label; 320]
    }

    #[test]
    fn capacity_is_computed_from_milliseconds() {
        // 500 ms at 8 kHz/16-bit/mono is 8000 bytes; 320-byte frames => 25.
        assert_eq!(buffer(500).capacity(), 25);
        assert_eq!(buffer(60).capacity(), 3);
    }

    #[test]
    fn frames_come_out_in_push_order_with_increasing_sequences() {
        let buf = buffer(500);
        for label in 0..5u8 {
            buf.push("s", frame_bytes(label));
        }

        let mut last_seq = None;
        for label in 0..5u8 {
            let frame = buf.pop().unwrap();
            assert_eq!(frame.data[0], label);
            if let Some(prev) = last_seq {
                assert!(frame.sequence > prev);
            }
            last_seq = Some(frame.sequence);
        }
        assert!(buf.pop().is_none());
    }

    #[test]
    fn drop_oldest_retains_the_most_recent_frames() {
        // Capacity 3; push A..E; C, D, E must remain, in order.
        let buf = buffer(60);
        for label in [b'A', b'B', b'C', b'D', b'E'] {
            buf.push("s", frame_bytes(label));
        }

        let survivors: Vec<u8> = std::iter::from_fn(|| buf.pop()).map(|f| f.data[0]).collect();
        assert_eq!(survivors, vec![b'C', b'D', b'E']);

        let metrics = buf.metrics();
        assert_eq!(metrics.frames_received, 5);
        assert_eq!(metrics.frames_dropped, 2);
        assert_eq!(metrics.overflow_events, 2);
    }

    #[test]
    fn push_reports_overflow_but_always_stores_the_frame() {
        let buf = buffer(60);
        assert!(buf.push("s", frame_bytes(1)));
        assert!(buf.push("s", frame_bytes(2)));
        assert!(buf.push("s", frame_bytes(3)));
        assert!(!buf.push("s", frame_bytes(4)));
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.pop().unwrap().data[0], 2);
    }

    #[test]
    fn overflow_accounting_balances() {
        let buf = buffer(60);
        for label in 0..10u8 {
            buf.push("s", frame_bytes(label));
        }
        buf.pop();
        buf.pop();

        let metrics = buf.metrics();
        assert_eq!(metrics.frames_dropped, metrics.overflow_events);
        assert_eq!(
            metrics.frames_received,
            metrics.frames_consumed + metrics.frames_dropped + buf.len() as u64
        );
        assert!(metrics.last_overflow_at.is_some());
    }

    #[test]
    fn clear_empties_and_reports_count() {
        let buf = buffer(500);
        for label in 0..4u8 {
            buf.push("s", frame_bytes(label));
        }
        assert_eq!(buf.clear(), 4);
        assert!(buf.is_empty());
        assert_eq!(buf.size_bytes(), 0);
    }

    #[test]
    fn size_and_fill_tracking() {
        let buf = buffer(500);
        assert_eq!(buf.size_ms(), 0.0);

        buf.push("s", frame_bytes(0));
        assert_eq!(buf.size_bytes(), 320);
        assert!((buf.size_ms() - 20.0).abs() < f64::EPSILON);
        assert!(buf.fill_ratio() > 0.0 && buf.fill_ratio() < 1.0);

        let metrics = buf.metrics();
        assert_eq!(metrics.peak_size_bytes, 320);
    }

    #[test]
    fn peek_does_not_consume() {
        let buf = buffer(500);
        buf.push("s", frame_bytes(7));
        assert_eq!(buf.peek().unwrap().data[0], 7);
        assert_eq!(buf.len(), 1);
        assert!(buf.oldest_age() >= Duration::ZERO);
    }

    #[test]
    fn push_is_fast_even_when_downstream_never_drains() {
        // The producer-side guarantee: pushing against a full buffer
        // (nothing consuming) stays comfortably under a millisecond.
        let buf = buffer(500);
        let start = Instant::now();
        for _ in 0..1_000 {
            buf.push("s", frame_bytes(0));
        }
        let elapsed = start.elapsed();
        assert!(
            elapsed < Duration::from_millis(100),
            "1000 pushes took {elapsed:?}"
        );
    }
}

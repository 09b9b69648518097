//! Voice-to-voice latency budget.
//!
//! One instance per interaction, from the end of the caller's speech to
//! the first byte of response audio and beyond. Stages are recorded as
//! they complete; `finish` logs the breakdown, at WARN when the target
//! was blown.

use std::collections::BTreeMap;
use std::time::Instant;

/// Default voice-to-voice target in milliseconds.
pub const DEFAULT_BUDGET_MS: f64 = 1_500.0;

/// Canonical stage names.
pub mod stage {
    pub const STT: &str = "stt";
    pub const LLM_TTFT: &str = "llm_ttft";
    pub const LLM_TOTAL: &str = "llm_total";
    pub const TTS_TTFB: &str = "tts_ttfb";
}

/// Per-interaction stage tracker.
#[derive(Debug)]
pub struct LatencyBudget {
    target_ms: f64,
    // Ordered map so the breakdown logs in a stable stage order.
    stages: BTreeMap<&'static str, f64>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl LatencyBudget {
    #[must_use]
    pub fn new(target_ms: f64) -> Self {
        Self {
            target_ms,
            stages: BTreeMap::new(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Mark the start of the interaction (caller speech ended now).
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Use an already-captured monotonic start point.
    pub fn start_from(&mut self, at: Instant) {
        self.started_at = Some(at);
    }

    /// Record one stage's duration in milliseconds.
    pub fn record_stage(&mut self, name: &'static str, duration_ms: f64) {
        self.stages.insert(name, duration_ms);
    }

    /// Close the interaction: one observation per budget instance.
    ///
    /// Logs the total with the stage breakdown — WARN over target,
    /// INFO otherwise. Repeat calls are ignored.
    pub fn finish(&mut self) {
        let Some(started_at) = self.started_at else {
            return;
        };
        if self.finished_at.is_some() {
            return;
        }

        let now = Instant::now();
        self.finished_at = Some(now);
        let total_ms = now.duration_since(started_at).as_secs_f64() * 1_000.0;

        let breakdown = self
            .stages
            .iter()
            .map(|(name, ms)| format!("{name}: {ms:.0}ms"))
            .collect::<Vec<_>>()
            .join(", ");

        if total_ms > self.target_ms {
            tracing::warn!(
                total_ms = format_args!("{total_ms:.0}"),
                target_ms = format_args!("{:.0}", self.target_ms),
                stages = %breakdown,
                "Latency budget exceeded"
            );
        } else {
            tracing::info!(
                total_ms = format_args!("{total_ms:.0}"),
                target_ms = format_args!("{:.0}", self.target_ms),
                stages = %breakdown,
                "Latency within budget"
            );
        }
    }

    /// Elapsed (or final) total in milliseconds.
    #[must_use]
    pub fn total_ms(&self) -> f64 {
        let Some(started_at) = self.started_at else {
            return 0.0;
        };
        let end = self.finished_at.unwrap_or_else(Instant::now);
        end.duration_since(started_at).as_secs_f64() * 1_000.0
    }

    #[must_use]
    pub fn is_over_budget(&self) -> bool {
        self.total_ms() > self.target_ms
    }

    /// Read-only view of the recorded stages.
    #[must_use]
    pub const fn stages(&self) -> &BTreeMap<&'static str, f64> {
        &self.stages
    }

    #[must_use]
    pub const fn target_ms(&self) -> f64 {
        self.target_ms
    }
}

impl Default for LatencyBudget {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unstarted_budget_reports_zero() {
        let mut budget = LatencyBudget::default();
        assert!((budget.total_ms() - 0.0).abs() < f64::EPSILON);
        budget.finish(); // no-op without start
        assert!(!budget.is_over_budget());
    }

    #[test]
    fn stages_are_recorded_and_total_accumulates() {
        let mut budget = LatencyBudget::new(1_500.0);
        budget.start();
        budget.record_stage(stage::STT, 120.0);
        budget.record_stage(stage::LLM_TTFT, 300.0);
        budget.record_stage(stage::LLM_TOTAL, 650.0);
        budget.record_stage(stage::TTS_TTFB, 90.0);

        std::thread::sleep(Duration::from_millis(10));
        budget.finish();

        assert_eq!(budget.stages().len(), 4);
        assert!(budget.total_ms() >= 10.0);
        assert!(!budget.is_over_budget());
    }

    #[test]
    fn finish_records_at_most_one_observation() {
        let mut budget = LatencyBudget::new(1_500.0);
        budget.start();
        std::thread::sleep(Duration::from_millis(5));
        budget.finish();
        let first = budget.total_ms();

        std::thread::sleep(Duration::from_millis(5));
        budget.finish();
        assert!((budget.total_ms() - first).abs() < f64::EPSILON);
    }

    #[test]
    fn tiny_target_is_over_budget() {
        let mut budget = LatencyBudget::new(0.001);
        budget.start();
        std::thread::sleep(Duration::from_millis(2));
        budget.finish();
        assert!(budget.is_over_budget());
    }

    #[test]
    fn start_from_uses_the_supplied_instant() {
        let mut budget = LatencyBudget::new(1_500.0);
        let earlier = Instant::now() - Duration::from_millis(50);
        budget.start_from(earlier);
        assert!(budget.total_ms() >= 50.0);
    }
}

//! Fixed-timestep accumulator.
//!
//! One call to [`FixedTimestep::advance`] per real-time tick:
//!
//! ```text
//! acc = min(acc + elapsed, Δ·(K+1))
//!
//! acc ≥ Δ ── acc -= Δ ──┬─ skipped < K and acc ≥ Δ ─> SKIP   (sim|stream), skipped += 1
//!                       ├─ skipped < K               ─> FULL   (all),        skipped = 0
//!                       └─ skipped = K ─ drain acc   ─> FULL   (all),        skipped = 0
//! acc < Δ ─────────────────────────────────────────────> RENDER (render),     skipped = 0
//! ```
//!
//! After every call `acc ∈ [0, Δ·(K+1))` and `skipped ≤ K`.

use std::time::Duration;

use crate::task::TaskCategory;

/// Categories run on a skip tick.
pub const SKIP_CATEGORIES: TaskCategory = TaskCategory::from_bits_truncate(
    TaskCategory::SIMULATION.bits() | TaskCategory::STREAMING.bits(),
);

/// Categories run on a render-only tick.
pub const RENDER_CATEGORIES: TaskCategory = TaskCategory::RENDERING;

/// What a single tick should run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepDecision {
    /// Categories eligible this tick.
    pub categories: TaskCategory,
    /// Accumulator over Δ after the decision. May exceed 1 on skip ticks.
    pub alpha: f32,
    /// Consecutive skip ticks before this one.
    pub frames_skipped: u32,
    /// Wall-clock elapsed plus Δ for each skipped frame.
    pub actual_elapsed: Duration,
}

/// Accumulator state machine.
#[derive(Clone, Debug)]
pub struct FixedTimestep {
    step: Duration,
    max_frameskip: u32,
    accumulator: Duration,
    skipped: u32,
}

impl FixedTimestep {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new(step: Duration, max_frameskip: u32) -> Self {
        Self {
            step,
            max_frameskip,
            accumulator: Duration::ZERO,
            skipped: 0,
        }
    }

    /// Δ.
    #[inline]
    #[must_use]
    pub fn step(&self) -> Duration {
        self.step
    }

    /// K.
    #[inline]
    #[must_use]
    pub fn max_frameskip(&self) -> u32 {
        self.max_frameskip
    }

    /// Time banked but not yet simulated.
    #[inline]
    #[must_use]
    pub fn accumulator(&self) -> Duration {
        self.accumulator
    }

    /// Current run of consecutive skip ticks.
    #[inline]
    #[must_use]
    pub fn frames_skipped(&self) -> u32 {
        self.skipped
    }

    /// Upper bound of the accumulator, Δ·(K+1).
    #[must_use]
    pub fn ceiling(&self) -> Duration {
        self.step * (self.max_frameskip + 1)
    }

    pub(crate) fn set_step(&mut self, step: Duration) {
        self.step = step;
        self.accumulator = self.accumulator.min(self.ceiling().saturating_sub(Duration::from_nanos(1)));
    }

    pub(crate) fn set_max_frameskip(&mut self, max_frameskip: u32) {
        self.max_frameskip = max_frameskip;
        self.skipped = self.skipped.min(max_frameskip);
        self.accumulator = self.accumulator.min(self.ceiling().saturating_sub(Duration::from_nanos(1)));
    }

    /// Banks `elapsed` and decides what this tick runs.
    pub fn advance(&mut self, elapsed: Duration) -> StepDecision {
        let frames_skipped = self.skipped;
        let actual_elapsed = elapsed + self.step * frames_skipped;

        self.accumulator = (self.accumulator + elapsed).min(self.ceiling());

        let categories = if self.accumulator >= self.step {
            self.accumulator -= self.step;

            if self.skipped < self.max_frameskip {
                if self.accumulator >= self.step {
                    self.skipped += 1;
                    SKIP_CATEGORIES
                } else {
                    self.skipped = 0;
                    TaskCategory::ALL
                }
            } else {
                // Give up catching up: simulated time falls behind wall time
                while self.accumulator >= self.step {
                    self.accumulator -= self.step;
                }
                self.skipped = 0;
                TaskCategory::ALL
            }
        } else {
            self.skipped = 0;
            RENDER_CATEGORIES
        };

        StepDecision {
            categories,
            alpha: self.accumulator.as_secs_f32() / self.step.as_secs_f32(),
            frames_skipped,
            actual_elapsed,
        }
    }

    /// One full step, bypassing the accumulator.
    #[must_use]
    pub fn full_step(&self, elapsed: Duration) -> StepDecision {
        StepDecision {
            categories: TaskCategory::ALL,
            alpha: 1.0,
            frames_skipped: 0,
            actual_elapsed: elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_documented_scenario() {
        let mut ts = FixedTimestep::new(Duration::from_secs(1) / 30, 2);

        let first = ts.advance(ms(40));
        assert_eq!(first.categories, TaskCategory::ALL);

        let second = ts.advance(ms(40));
        assert_eq!(second.categories, TaskCategory::ALL);

        let third = ts.advance(ms(5));
        assert_eq!(third.categories, RENDER_CATEGORIES);
        assert!(third.alpha > 0.0 && third.alpha < 1.0);
    }

    #[test]
    fn test_slow_burst_skips_at_most_k() {
        let mut ts = FixedTimestep::new(ms(10), 2);

        let decisions: Vec<_> = (0..4).map(|_| ts.advance(ms(100)).categories).collect();
        // Burst is clamped to 30ms of backlog: skip, skip, then forced full tick
        assert_eq!(decisions[0], SKIP_CATEGORIES);
        assert_eq!(decisions[1], SKIP_CATEGORIES);
        assert_eq!(decisions[2], TaskCategory::ALL);
        assert!(ts.accumulator() < ms(10) || decisions[3] == SKIP_CATEGORIES);
    }

    #[test]
    fn test_zero_frameskip_never_skips() {
        let mut ts = FixedTimestep::new(ms(10), 0);
        for _ in 0..5 {
            let d = ts.advance(ms(50));
            assert_eq!(d.categories, TaskCategory::ALL);
            assert!(ts.accumulator() < ms(10));
        }
    }

    #[test]
    fn test_render_only_resets_skip_counter() {
        let mut ts = FixedTimestep::new(ms(10), 3);
        ts.advance(ms(25));
        assert_eq!(ts.frames_skipped(), 1);

        let d = ts.advance(ms(0));
        assert_eq!(d.categories, TaskCategory::ALL);
        let d = ts.advance(ms(0));
        assert_eq!(d.categories, RENDER_CATEGORIES);
        assert_eq!(ts.frames_skipped(), 0);
    }

    #[test]
    fn test_actual_elapsed_counts_skipped_frames() {
        let mut ts = FixedTimestep::new(ms(10), 2);
        let first = ts.advance(ms(25));
        assert_eq!(first.actual_elapsed, ms(25));
        assert_eq!(first.categories, SKIP_CATEGORIES);

        let second = ts.advance(ms(1));
        assert_eq!(second.frames_skipped, 1);
        assert_eq!(second.actual_elapsed, ms(11));
    }

    #[test]
    fn test_accumulator_and_skip_bounds_hold() {
        let mut ts = FixedTimestep::new(ms(16), 2);
        let mut run = 0u32;
        let pattern = [1, 90, 3, 50, 17, 0, 200, 16, 15, 33, 48, 2];

        for (i, &elapsed) in pattern.iter().cycle().take(600).enumerate() {
            let d = ts.advance(ms(elapsed + (i as u64 % 7)));
            assert!(ts.accumulator() < ts.ceiling());
            run = if d.categories == SKIP_CATEGORIES { run + 1 } else { 0 };
            assert!(run <= ts.max_frameskip());
        }
    }
}

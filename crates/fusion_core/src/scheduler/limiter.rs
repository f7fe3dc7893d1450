//! Frame limiter: blocks until a full step has passed since the last tick.

use std::time::{Duration, Instant};

/// Below this, sleeping overshoots too much; spin instead.
const SPIN_THRESHOLD: Duration = Duration::from_micros(1000);

/// Sleep this much short of the deadline, then spin the rest.
const SPIN_MARGIN: Duration = Duration::from_micros(500);

/// Paces ticks to at most one per interval.
#[derive(Clone, Debug)]
pub struct FrameLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl FrameLimiter {
    /// Creates a limiter. The first wait returns immediately.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// Target interval.
    #[inline]
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub(crate) fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Blocks until `interval` has passed since the previous return, then
    /// returns the time actually elapsed since it.
    pub fn wait(&mut self) -> Duration {
        let Some(last) = self.last else {
            self.last = Some(Instant::now());
            return Duration::ZERO;
        };

        let elapsed = last.elapsed();
        if elapsed < self.interval {
            let remaining = self.interval - elapsed;
            if remaining > SPIN_THRESHOLD {
                std::thread::sleep(remaining - SPIN_MARGIN);
            }
            while last.elapsed() < self.interval {
                std::hint::spin_loop();
            }
        }

        let now = Instant::now();
        self.last = Some(now);
        now.duration_since(last)
    }

    /// Forgets the previous tick.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_wait_is_immediate() {
        let mut limiter = FrameLimiter::new(Duration::from_secs(10));
        assert_eq!(limiter.wait(), Duration::ZERO);
    }

    #[test]
    fn test_wait_paces_to_interval() {
        let interval = Duration::from_millis(5);
        let mut limiter = FrameLimiter::new(interval);
        limiter.wait();

        let start = Instant::now();
        for _ in 0..3 {
            assert!(limiter.wait() >= interval);
        }
        assert!(start.elapsed() >= interval * 2);
    }
}

//! Countdown latch: one thread waits until N completions have been recorded.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub(crate) struct Latch {
    remaining: Mutex<usize>,
    released: Condvar,
}

impl Latch {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            released: Condvar::new(),
        }
    }

    pub(crate) fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        debug_assert!(*remaining > 0, "latch counted down past zero");
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.released.notify_all();
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        *self.remaining.lock() == 0
    }

    /// Blocks until the count reaches zero.
    pub(crate) fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.released.wait(&mut remaining);
        }
    }

    /// Blocks for at most `timeout`. Returns true once released.
    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let mut remaining = self.remaining.lock();
        if *remaining > 0 {
            let _ = self.released.wait_for(&mut remaining, timeout);
        }
        *remaining == 0
    }
}

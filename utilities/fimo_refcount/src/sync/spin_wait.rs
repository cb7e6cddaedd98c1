// Copyright 2016 Amanieu d'Antras
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Number of doubling busy-wait rounds before falling back to thread yields.
const SPIN_THRESHOLD: usize = 3;

/// A counter used to perform exponential backoff in spin loops.
#[derive(Debug, Default)]
pub struct SpinWait {
    count: usize,
}

impl SpinWait {
    /// Creates a new `SpinWait`.
    #[inline]
    pub fn new() -> Self {
        Default::default()
    }

    /// Resets a `SpinWait` to its initial state.
    #[inline]
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Returns whether the next call to [`spin`](SpinWait::spin) yields the thread.
    #[inline]
    pub fn is_yielding(&self) -> bool {
        self.count >= SPIN_THRESHOLD
    }

    /// Waits a little before the next attempt.
    ///
    /// The first rounds issue `2^n` CPU spin hints, later rounds yield the time slice of the
    /// current thread to the OS scheduler.
    #[inline]
    pub fn spin(&mut self) {
        if self.count < SPIN_THRESHOLD {
            self.count += 1;
            for _ in 0..(1 << self.count) {
                std::hint::spin_loop()
            }
        } else {
            std::thread::yield_now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SpinWait, SPIN_THRESHOLD};

    #[test]
    fn falls_back_to_yield() {
        let mut wait = SpinWait::new();
        for _ in 0..SPIN_THRESHOLD {
            assert!(!wait.is_yielding());
            wait.spin();
        }
        assert!(wait.is_yielding());

        // Yielding rounds do not advance the counter any further.
        wait.spin();
        assert!(wait.is_yielding());

        wait.reset();
        assert!(!wait.is_yielding());
    }
}

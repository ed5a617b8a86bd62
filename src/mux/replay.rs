// Sliding-bitmap replay protection over packet counters.
// Numan Thabit 2025

/// Width of the replay window in packet counters.
pub const WINDOW_SIZE: u64 = 64;

/// 64-wide sliding window over packet counters.
///
/// A counter is accepted when it is strictly ahead of the highest seen, or
/// falls inside the window with its bit still clear. Anything at or behind
/// the trailing edge is a replay.
#[derive(Debug, Default)]
pub struct ReplayWindow {
    highest: u64,
    bitmap: u64,
    initialized: bool,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether `counter` would be accepted, without recording it.
    pub fn check(&self, counter: u64) -> bool {
        if !self.initialized {
            return true;
        }

        if counter > self.highest {
            return true;
        }

        if counter == self.highest {
            return false;
        }

        let diff = self.highest - counter - 1;
        if diff < WINDOW_SIZE {
            return self.bitmap & (1u64 << diff) == 0;
        }

        false
    }

    /// Records `counter` as seen.
    pub fn update(&mut self, counter: u64) {
        if !self.initialized {
            self.highest = counter;
            self.bitmap = 0;
            self.initialized = true;
            return;
        }

        if counter > self.highest {
            let shift = counter - self.highest;
            self.bitmap = if shift >= WINDOW_SIZE {
                0
            } else {
                // Shift the window forward and record the previous highest.
                (self.bitmap << shift) | (1u64 << (shift - 1))
            };
            self.highest = counter;
        } else if counter < self.highest {
            let diff = self.highest - counter - 1;
            if diff < WINDOW_SIZE {
                self.bitmap |= 1u64 << diff;
            }
        }
        // counter == highest: nothing to record.
    }

    /// Atomic check-then-record.
    pub fn check_and_update(&mut self, counter: u64) -> bool {
        if !self.check(counter) {
            return false;
        }
        self.update(counter);
        true
    }

    pub fn reset(&mut self) {
        self.highest = 0;
        self.bitmap = 0;
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_counter_always_accepted() {
        let mut window = ReplayWindow::new();
        assert!(window.check_and_update(0));
        let mut window = ReplayWindow::new();
        assert!(window.check_and_update(1_000_000));
    }

    #[test]
    fn duplicate_rejected() {
        let mut window = ReplayWindow::new();
        assert!(window.check_and_update(5));
        assert!(!window.check_and_update(5));
    }

    #[test]
    fn in_window_out_of_order_accepted_once() {
        let mut window = ReplayWindow::new();
        assert!(window.check_and_update(10));
        assert!(window.check_and_update(7));
        assert!(!window.check_and_update(7));
        assert!(window.check_and_update(8));
        assert!(!window.check_and_update(8));
    }

    #[test]
    fn too_old_rejected() {
        let mut window = ReplayWindow::new();
        assert!(window.check_and_update(100));
        // 100 - 36 - 1 = 63: still inside the window.
        assert!(window.check_and_update(36));
        // 100 - 35 - 1 = 64: behind the trailing edge.
        assert!(!window.check_and_update(35));
    }

    #[test]
    fn large_jump_clears_bitmap() {
        let mut window = ReplayWindow::new();
        assert!(window.check_and_update(1));
        assert!(window.check_and_update(1 + WINDOW_SIZE + 10));
        // Everything in the old window is now too old.
        assert!(!window.check_and_update(1));
        assert!(window.check_and_update(WINDOW_SIZE + 5));
    }

    #[test]
    fn previous_highest_recorded_on_advance() {
        let mut window = ReplayWindow::new();
        assert!(window.check_and_update(10));
        assert!(window.check_and_update(11));
        assert!(!window.check_and_update(10));
    }

    proptest! {
        #[test]
        fn accepted_counter_never_accepted_twice(
            counters in prop::collection::vec(0u64..10_000, 1..200)
        ) {
            let mut window = ReplayWindow::new();
            let mut accepted = Vec::new();
            for counter in counters {
                if window.check_and_update(counter) {
                    accepted.push(counter);
                }
                // Law: anything accepted so far must now be rejected.
                for &seen in &accepted {
                    prop_assert!(!window.check(seen));
                }
            }
        }
    }
}

//! Reconnect delay policy: exponential growth with a floor and cap

use std::time::Duration;

/// Exponential backoff state for the reconnect loop.
///
/// Consecutive failures double the delay up to the cap; a successful
/// streaming period resets it to the floor.
#[derive(Debug)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration) -> Self {
        Self {
            floor,
            cap,
            current: floor,
        }
    }

    /// The delay to wait before the next attempt.
    ///
    /// Each call consumes the current delay and doubles it for the next
    /// failure, saturating at the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    /// Reset to the floor after a successful streaming period.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

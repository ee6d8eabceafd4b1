// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Exponential backoff with jitter proportional to the current step.
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            max,
            current: initial,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt. Each call doubles the base step up to the
    /// maximum.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;

        let backoff_ms = self.current.as_millis() as i64;
        let mut v = backoff_ms / 2;
        if v == 0 {
            v = 1;
        }
        let jitter = (rand::random::<i64>() % v) - (v / 2);
        let sleep_ms = (backoff_ms + jitter).max(1);

        self.current = (self.current * 2).min(self.max);
        Duration::from_millis(sleep_ms as u64)
    }
}

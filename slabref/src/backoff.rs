//! Contention backoff for the spinning latches.
//!
//! Every `spin_limit` failed attempts the waiter either yields or sleeps for
//! a duration proportional to the attempt count, alternating between the
//! two. Thresholds come from [`LatchConfig`].

use crate::config::{self, LatchConfig};
use std::thread;
use std::time::Duration;

pub(crate) struct Backoff {
    config: LatchConfig,
    attempts: u64,
    pauses: u64,
}

impl Backoff {
    #[inline]
    pub(crate) fn new() -> Self {
        Self::with_config(config::get().latch)
    }

    #[inline]
    pub(crate) fn with_config(config: LatchConfig) -> Self {
        Self {
            config,
            attempts: 0,
            pauses: 0,
        }
    }

    /// Record one failed attempt, pausing when the spin budget is spent.
    #[inline]
    pub(crate) fn snooze(&mut self) {
        self.attempts += 1;
        let limit = u64::from(self.config.spin_limit.max(1));
        if self.attempts % limit != 0 {
            core::hint::spin_loop();
            return;
        }

        self.pauses += 1;
        if self.pauses % 2 == 1 {
            thread::sleep(self.sleep_for());
        } else {
            thread::yield_now();
        }
    }

    fn sleep_for(&self) -> Duration {
        let nanos = self
            .attempts
            .saturating_mul(self.config.sleep_step_nanos)
            .min(self.config.max_sleep_nanos);
        Duration::from_nanos(nanos)
    }

    #[cfg(test)]
    pub(crate) fn attempts(&self) -> u64 {
        self.attempts
    }
}

//! Monotonic time source and retry scheduling

use embassy_time::{Duration, Instant};

/// Monotonic clock the connectivity and session logic is driven by.
///
/// The firmware uses the embassy timer; tests use a manual clock whose `sleep`
/// only advances the reported time.
#[allow(async_fn_in_trait)]
pub trait Clock {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Fixed-interval retry state: when the next attempt may run and how many ran so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    interval: Duration,
    next_eligible: Option<Instant>,
    attempts: u32,
}

impl RetrySchedule {
    /// A schedule whose first attempt is due immediately
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_eligible: None,
            attempts: 0,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.next_eligible {
            None => true,
            Some(at) => now >= at,
        }
    }

    /// Record an attempt made at `now`; the next one becomes due one interval later
    pub fn record_attempt(&mut self, now: Instant) {
        self.attempts = self.attempts.saturating_add(1);
        self.next_eligible = Some(now + self.interval);
    }

    /// Push the next attempt one full interval past `now` without counting an attempt
    pub fn defer(&mut self, now: Instant) {
        self.next_eligible = Some(now + self.interval);
    }

    /// Make the next attempt due immediately and forget the attempt count
    pub fn reset(&mut self) {
        self.next_eligible = None;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_eligible(&self) -> Option<Instant> {
        self.next_eligible
    }
}

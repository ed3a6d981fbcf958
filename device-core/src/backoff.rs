use core::time::Duration;

/// Exponential backoff: `min(base * 2^attempt, max)`.
///
/// `attempt` counts consecutive failures and is reset on success. Callers ask
/// [`Backoff::is_due`] every tick instead of sleeping.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
    last_attempt: Option<Duration>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
            last_attempt: None,
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        // 2^31 * any non-zero base already saturates every realistic ceiling
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Delay that must elapse after the last attempt before the next one.
    pub fn current_delay(&self) -> Duration {
        self.delay_for(self.attempt)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_due(&self, now: Duration) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.current_delay(),
        }
    }

    /// Time left until the next attempt is allowed.
    pub fn remaining(&self, now: Duration) -> Duration {
        match self.last_attempt {
            None => Duration::ZERO,
            Some(last) => (last + self.current_delay()).saturating_sub(now),
        }
    }

    pub fn mark_attempt(&mut self, now: Duration) {
        self.last_attempt = Some(now);
    }

    pub fn record_failure(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

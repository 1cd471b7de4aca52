//! Reconnect backoff.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Consecutive failed attempts since the last successful open.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    attempts: u32,
}

impl RetryState {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_open(&mut self) {
        self.attempts = 0;
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn on_close(&mut self, policy: &ReconnectPolicy) -> Option<Duration> {
        if self.attempts >= policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(policy.delay_for(self.attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_retries_with_capped_backoff_then_stop() {
        let policy = ReconnectPolicy::default();
        let mut retry = RetryState::default();

        let delays: Vec<u64> = (0..5)
            .map(|_| retry.on_close(&policy).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 30000]);
        assert_eq!(retry.on_close(&policy), None);
        assert_eq!(retry.attempts(), 5);
    }

    #[test]
    fn successful_open_resets_the_budget() {
        let policy = ReconnectPolicy::default();
        let mut retry = RetryState::default();
        retry.on_close(&policy);
        retry.on_close(&policy);
        retry.on_open();

        assert_eq!(retry.attempts(), 0);
        assert_eq!(retry.on_close(&policy), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(40), policy.cap);
    }
}

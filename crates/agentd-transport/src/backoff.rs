//! Client-side reconnection backoff schedule.
//!
//! The connection manager tolerates this contract rather than enforcing it:
//! clients wait `min(base * 2^attempt + jitter, max)` before each attempt,
//! and give up after `MAX_ATTEMPTS`, at which point the server surfaces a
//! terminal error instead of another retry hint.

use std::time::Duration;

use rand::Rng;

/// First-attempt delay.
pub const BASE_DELAY: Duration = Duration::from_millis(500);
/// Delay ceiling.
pub const MAX_DELAY: Duration = Duration::from_secs(30);
/// Attempts before the failure is terminal.
pub const MAX_ATTEMPTS: u32 = 10;

/// Jitter bound added before capping.
const JITTER_MS: u64 = 250;

/// Delay before reconnect attempt `attempt` (0-based):
/// `min(500ms * 2^attempt + jitter, 30s)`.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponential = BASE_DELAY.saturating_mul(2u32.saturating_pow(attempt));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_MS));
    exponential.saturating_add(jitter).min(MAX_DELAY)
}

/// Iterator over the full backoff schedule; yields `MAX_ATTEMPTS` delays
/// then ends, signalling the terminal failure.
#[derive(Debug, Default)]
pub struct ReconnectSchedule {
    attempt: u32,
}

impl ReconnectSchedule {
    #[must_use]
    pub const fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Attempts taken so far.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Iterator for ReconnectSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= MAX_ATTEMPTS {
            return None;
        }
        let delay = backoff_delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_satisfies_the_formula() {
        for attempt in 0..MAX_ATTEMPTS {
            let floor = BASE_DELAY
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(MAX_DELAY);
            let ceiling = BASE_DELAY
                .saturating_mul(2u32.saturating_pow(attempt))
                .saturating_add(Duration::from_millis(JITTER_MS))
                .min(MAX_DELAY);

            for _ in 0..20 {
                let delay = backoff_delay(attempt);
                assert!(delay >= floor, "attempt {attempt}: {delay:?} under floor {floor:?}");
                assert!(delay <= ceiling, "attempt {attempt}: {delay:?} over ceiling {ceiling:?}");
            }
        }
    }

    #[test]
    fn expected_delay_is_monotone_and_capped() {
        let mut previous = Duration::ZERO;
        for attempt in 0..MAX_ATTEMPTS {
            let expected_floor = BASE_DELAY
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(MAX_DELAY);
            assert!(expected_floor >= previous);
            assert!(expected_floor <= MAX_DELAY);
            previous = expected_floor;
        }
        // By attempt 7 the exponential alone exceeds the cap.
        assert_eq!(backoff_delay(9), MAX_DELAY);
    }

    #[test]
    fn schedule_ends_after_ten_attempts() {
        let schedule = ReconnectSchedule::new();
        assert_eq!(schedule.count(), MAX_ATTEMPTS as usize);

        let mut schedule = ReconnectSchedule::new();
        for _ in 0..MAX_ATTEMPTS {
            assert!(schedule.next().is_some());
        }
        assert!(schedule.next().is_none(), "the eleventh attempt is terminal");
    }
}

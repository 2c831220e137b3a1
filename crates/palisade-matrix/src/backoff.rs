//! Exponential backoff with full jitter for sync reconnection delays.
//!
//! `delay = random(0, min(cap, base * multiplier^attempt))`.

use std::time::Duration;

/// Exponential backoff calculator with full jitter.
#[derive(Debug)]
pub struct Backoff {
    /// Base delay in milliseconds.
    base_ms: u64,
    /// Maximum delay cap in milliseconds.
    max_ms: u64,
    /// Growth factor per attempt.
    multiplier: f64,
    /// Current attempt number (0-indexed).
    attempt: u32,
}

impl Backoff {
    /// Create a new backoff calculator.
    #[must_use]
    pub fn new(base_ms: u64, max_ms: u64, multiplier: f64) -> Self {
        Self {
            base_ms,
            max_ms,
            multiplier: if multiplier < 1.0 { 1.0 } else { multiplier },
            attempt: 0,
        }
    }

    /// Compute the next delay with full jitter and advance the attempt.
    pub fn next_delay(&mut self) -> Duration {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let exp = {
            let raw = (self.base_ms as f64) * self.multiplier.powi(self.attempt.min(63) as i32);
            if raw.is_finite() && raw >= 0.0 {
                raw.min(u64::MAX as f64) as u64
            } else {
                self.max_ms
            }
        };
        let capped = exp.min(self.max_ms);
        let jittered = if capped == 0 { 0 } else { fastrand::u64(0..=capped) };
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(jittered)
    }

    /// How many consecutive failures this backoff has seen.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Reset the attempt counter after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delay_bounded_by_base() {
        let mut b = Backoff::new(1000, 60_000, 2.0);
        for _ in 0..100 {
            b.attempt = 0;
            let delay = b.next_delay();
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn delay_capped_at_max() {
        let mut b = Backoff::new(1000, 5000, 2.0);
        for _ in 0..20 {
            let delay = b.next_delay();
            assert!(delay <= Duration::from_millis(5000));
        }
    }

    #[test]
    fn reset_resets_attempt() {
        let mut b = Backoff::new(1000, 60_000, 2.0);
        for _ in 0..5 {
            let _ = b.next_delay();
        }
        assert_eq!(b.attempts(), 5);
        b.reset();
        assert_eq!(b.attempts(), 0);
    }

    #[test]
    fn zero_base_produces_zero_delay() {
        let mut b = Backoff::new(0, 0, 2.0);
        for _ in 0..10 {
            assert_eq!(b.next_delay(), Duration::ZERO);
        }
    }

    #[test]
    fn multiplier_below_one_clamped() {
        let mut b = Backoff::new(1000, 60_000, 0.5);
        // With a clamped multiplier of 1.0 the cap stays at base.
        for _ in 0..10 {
            assert!(b.next_delay() <= Duration::from_millis(1000));
        }
    }
}

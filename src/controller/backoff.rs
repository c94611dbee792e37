//! # Exponential Backoff
//!
//! Provides an exponential backoff with jitter for retrying failed reconciles.
//!
//! The ceiling for attempt `n` is `min(max, base * 2^n)`. Each delay handed out
//! is the ceiling reduced by a random fraction in `[0, jitter]`, so a burst of
//! resources failing together does not retry in lockstep.
//!
//! ## Usage
//!
//! ```rust
//! use kms_secrets_controller::controller::backoff::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300), 0.0);
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
//! ```

use rand::Rng;
use std::time::Duration;

/// Backoff parameters shared by every resource
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of each delay that may be randomised away (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(crate::constants::DEFAULT_BACKOFF_BASE_MS),
            max: Duration::from_millis(crate::constants::DEFAULT_BACKOFF_MAX_MS),
            jitter: crate::constants::DEFAULT_BACKOFF_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Fresh per-resource backoff following this policy
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.base, self.max, self.jitter)
    }
}

/// Exponential backoff calculator
///
/// Tracks the attempt count of a single resource; [`reset`](Self::reset)
/// after a success brings the next delay back to `base`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the delay for the current attempt, before jitter
    pub fn current_ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Get the next backoff duration and advance the attempt counter
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        self.next_backoff_with(&mut rand::thread_rng())
    }

    /// Same as [`next_backoff`](Self::next_backoff) with a caller-provided RNG
    pub fn next_backoff_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let ceiling = self.current_ceiling();
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter <= 0.0 {
            return ceiling;
        }
        let reduction = rng.gen_range(0.0..=self.jitter);
        ceiling.mul_f64(1.0 - reduction)
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ExponentialBackoff::new(secs(1), secs(300), 0.0);

        assert_eq!(backoff.next_backoff(), secs(1));
        assert_eq!(backoff.next_backoff(), secs(2));
        assert_eq!(backoff.next_backoff(), secs(4));
        assert_eq!(backoff.next_backoff(), secs(8));
        assert_eq!(backoff.next_backoff(), secs(16));
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn test_exponential_backoff_max_cap() {
        let mut backoff = ExponentialBackoff::new(secs(1), secs(300), 0.0);
        for _ in 0..8 {
            let _ = backoff.next_backoff();
        }
        // 2^8 = 256s, next would be 512s
        assert_eq!(backoff.next_backoff(), secs(300));
        assert_eq!(backoff.next_backoff(), secs(300));

        // Far past the shift width the ceiling stays at max
        for _ in 0..100 {
            let _ = backoff.next_backoff();
        }
        assert_eq!(backoff.next_backoff(), secs(300));
    }

    #[test]
    fn test_exponential_backoff_reset() {
        let mut backoff = ExponentialBackoff::new(secs(1), secs(300), 0.0);
        let _ = backoff.next_backoff();
        let _ = backoff.next_backoff();
        let _ = backoff.next_backoff();

        backoff.reset();

        assert_eq!(backoff.next_backoff(), secs(1));
        assert_eq!(backoff.next_backoff(), secs(2));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = ExponentialBackoff::new(secs(10), secs(300), 0.2);

        for _ in 0..20 {
            let ceiling = backoff.current_ceiling();
            let delay = backoff.next_backoff_with(&mut rng);
            assert!(delay <= ceiling, "{delay:?} above {ceiling:?}");
            assert!(delay >= ceiling.mul_f64(0.8), "{delay:?} below jitter floor");
        }
    }

    #[test]
    fn test_jitter_varies_delays() {
        let mut rng = StdRng::seed_from_u64(42);
        let policy = BackoffPolicy {
            base: secs(100),
            max: secs(100),
            jitter: 0.5,
        };
        let delays: Vec<Duration> = (0..10)
            .map(|_| policy.backoff().next_backoff_with(&mut rng))
            .collect();
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[test]
    fn test_per_resource_state() {
        let policy = BackoffPolicy {
            base: secs(1),
            max: secs(60),
            jitter: 0.0,
        };
        let mut first = policy.backoff();
        let mut second = policy.backoff();

        let _ = first.next_backoff();
        let _ = first.next_backoff();
        assert_eq!(first.next_backoff(), secs(4));

        assert_eq!(second.next_backoff(), secs(1));

        first.reset();
        assert_eq!(first.next_backoff(), secs(1));
        assert_eq!(second.next_backoff(), secs(2));
    }

    #[test]
    fn test_default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base, secs(1));
        assert_eq!(policy.max, secs(300));
        assert!((policy.jitter - 0.2).abs() < f64::EPSILON);
    }
}

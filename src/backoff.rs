//! Exponential backoff for the poll loop and HTTP retries.
//!
//! The delay is a function of the number of consecutive failures observed so far:
//! `0` failures yields the base interval, `n` failures yields `base * 2^min(n, cap)` clamped to
//! `max`. Computations that would overflow saturate to [`MAX_BACKOFF`] (1 day).
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use pollgate::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_secs(20))
//!     .with_max(Duration::from_secs(300))
//!     .unwrap()
//!     .with_exponent_cap(5);
//! assert_eq!(backoff.delay(0), Duration::from_secs(20));
//! assert_eq!(backoff.delay(1), Duration::from_secs(40));
//! assert_eq!(backoff.delay(3), Duration::from_secs(160));
//! assert_eq!(backoff.delay(4), Duration::from_secs(300)); // clamped by max
//! ```

use std::time::Duration;

use thiserror::Error;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponent cap used unless overridden.
pub const DEFAULT_EXPONENT_CAP: u32 = 5;

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    #[error("base must be greater than zero")]
    BaseMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

/// Doubling backoff with an exponent cap and an absolute ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    cap: u32,
}

impl Backoff {
    /// Doubling backoff starting at `base`, capped at [`MAX_BACKOFF`] until `with_max` is set.
    pub fn exponential(base: Duration) -> Self {
        Self { base, max: MAX_BACKOFF.max(base), cap: DEFAULT_EXPONENT_CAP }
    }

    /// Set the ceiling. Errors if `base` is zero or `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if self.base.is_zero() {
            return Err(BackoffError::BaseMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = max;
        Ok(self)
    }

    /// Limit how many doublings are applied, no matter how many failures accumulate.
    pub fn with_exponent_cap(mut self, cap: u32) -> Self {
        self.cap = cap;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay to wait after `failures` consecutive failures (0 = last attempt succeeded).
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.base.min(self.max);
        }
        let exponent = failures.min(self.cap);
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        delay.min(self.max).min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll_default() -> Backoff {
        Backoff::exponential(Duration::from_secs(20))
            .with_max(Duration::from_secs(300))
            .unwrap()
            .with_exponent_cap(5)
    }

    #[test]
    fn zero_failures_uses_base() {
        assert_eq!(poll_default().delay(0), Duration::from_secs(20));
    }

    #[test]
    fn doubles_per_failure_until_max() {
        let backoff = poll_default();
        assert_eq!(backoff.delay(1), Duration::from_secs(40));
        assert_eq!(backoff.delay(2), Duration::from_secs(80));
        assert_eq!(backoff.delay(3), Duration::from_secs(160));
        assert_eq!(backoff.delay(4), Duration::from_secs(300));
        assert_eq!(backoff.delay(50), Duration::from_secs(300));
    }

    #[test]
    fn exponent_cap_limits_growth_below_max() {
        let backoff = Backoff::exponential(Duration::from_millis(100))
            .with_max(Duration::from_secs(60))
            .unwrap()
            .with_exponent_cap(2);
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(9), Duration::from_millis(400));
    }

    #[test]
    fn huge_failure_counts_saturate() {
        let backoff = Backoff::exponential(Duration::from_secs(1)).with_exponent_cap(u32::MAX);
        assert_eq!(backoff.delay(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn rejects_max_below_base() {
        let err = Backoff::exponential(Duration::from_secs(100))
            .with_max(Duration::from_secs(50))
            .unwrap_err();
        assert!(matches!(err, BackoffError::MaxLessThanBase { .. }));
    }

    #[test]
    fn rejects_zero_base() {
        let err = Backoff::exponential(Duration::ZERO).with_max(Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, BackoffError::BaseMustBePositive);
    }
}

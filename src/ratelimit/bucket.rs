//! Token bucket implementation.

use std::time::Instant;

use crate::error::{Result, TurnstileError};

/// Capacity and refill rate shared by every bucket a registry creates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimits {
    /// Maximum number of tokens (the burst size)
    capacity: u32,
    /// Tokens added per second
    refill_per_second: f64,
}

impl BucketLimits {
    /// Create validated bucket limits.
    ///
    /// The rate must be finite and positive and the capacity non-zero.
    pub fn new(refill_per_second: f64, capacity: u32) -> Result<Self> {
        if !refill_per_second.is_finite() || refill_per_second <= 0.0 {
            return Err(TurnstileError::InvalidLimit(format!(
                "requests per second must be a positive number, got {}",
                refill_per_second
            )));
        }
        if capacity == 0 {
            return Err(TurnstileError::InvalidLimit(
                "burst must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            capacity,
            refill_per_second,
        })
    }

    /// Get the bucket capacity.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Get the refill rate in tokens per second.
    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }
}

/// A token bucket that admits one unit of work per available token.
///
/// The bucket is not synchronized; the registry wraps each one in a mutex so
/// that a refill and the following take happen as one step per key.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    limits: BucketLimits,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket starting now.
    pub fn new(limits: BucketLimits) -> Self {
        Self::new_at(limits, Instant::now())
    }

    /// Create a full bucket whose refill clock starts at `now`.
    pub fn new_at(limits: BucketLimits, now: Instant) -> Self {
        Self {
            limits,
            tokens: f64::from(limits.capacity),
            last_refill: now,
        }
    }

    /// Try to take a token.
    ///
    /// Returns `true` if the request is admitted, `false` if the bucket is empty.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Try to take a token as of `now`.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently held, without refilling.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Get the limits this bucket was created with.
    pub fn limits(&self) -> BucketLimits {
        self.limits
    }

    fn refill(&mut self, now: Instant) {
        // An older instant than the last refill adds nothing and must not
        // rewind the clock.
        let elapsed = now.saturating_duration_since(self.last_refill);
        let capacity = f64::from(self.limits.capacity);

        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.limits.refill_per_second)
            .min(capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits(rate: f64, burst: u32) -> BucketLimits {
        BucketLimits::new(rate, burst).unwrap()
    }

    #[test]
    fn test_limits_reject_non_positive_values() {
        assert!(BucketLimits::new(0.0, 10).is_err());
        assert!(BucketLimits::new(-1.0, 10).is_err());
        assert!(BucketLimits::new(f64::NAN, 10).is_err());
        assert!(BucketLimits::new(f64::INFINITY, 10).is_err());
        assert!(BucketLimits::new(10.0, 0).is_err());
        assert!(BucketLimits::new(0.5, 1).is_ok());
    }

    #[test]
    fn test_new_bucket_starts_full() {
        let bucket = TokenBucket::new(limits(10.0, 20));
        assert_eq!(bucket.tokens(), 20.0);
        assert_eq!(bucket.limits().capacity(), 20);
    }

    #[test]
    fn test_burst_then_reject() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(limits(10.0, 20), start);

        let admitted = (0..25).filter(|_| bucket.allow_at(start)).count();

        assert_eq!(admitted, 20);
        assert!(!bucket.allow_at(start));
    }

    #[test]
    fn test_refill_after_one_second() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(limits(10.0, 20), start);
        for _ in 0..25 {
            bucket.allow_at(start);
        }

        let later = start + Duration::from_secs(1);
        for i in 0..10 {
            assert!(bucket.allow_at(later), "request {} should be admitted", i);
        }
        assert!(!bucket.allow_at(later));
    }

    #[test]
    fn test_tokens_capped_at_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(limits(10.0, 20), start);

        assert!(bucket.allow_at(start + Duration::from_secs(100)));
        assert!(bucket.tokens() <= 19.0);
        assert!(bucket.tokens() >= 0.0);
    }

    #[test]
    fn test_fractional_refill_accumulates() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(limits(2.0, 1), start);
        assert!(bucket.allow_at(start));

        // Half a token is not enough.
        assert!(!bucket.allow_at(start + Duration::from_millis(250)));
        assert!(bucket.allow_at(start + Duration::from_millis(500)));
    }

    #[test]
    fn test_stale_instant_does_not_rewind_clock() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(limits(1.0, 1), start);
        let later = start + Duration::from_secs(5);

        assert!(bucket.allow_at(later));
        assert!(!bucket.allow_at(start));
        // Still only one second past the last refill.
        assert!(bucket.allow_at(later + Duration::from_secs(1)));
    }
}
